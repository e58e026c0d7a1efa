use fileblock::{BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder, BLOCK_SIZE};
use tempfile::NamedTempFile;
use xcfs::{FatxVolume, Volume, VolumeConfig, XcfsError};

const IMAGE_BLOCKS: usize = 256;

fn init() {
  let _ = env_logger::builder().is_test(true).try_init();
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
  (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}

fn formatted(tf: &NamedTempFile) -> FatxVolume<FileBlockEmulator> {
  let emu = FileBlockEmulatorBuilder::from(tf.reopen().unwrap())
    .with_block_count(IMAGE_BLOCKS)
    .build()
    .unwrap();
  FatxVolume::format(emu, VolumeConfig::default()).unwrap()
}

#[test]
fn truncating_a_file_frees_whole_clusters() {
  init();
  let tf = NamedTempFile::new().unwrap();
  let mut vol = formatted(&tf);
  let root = vol.root();

  let file = vol.create_file(root, "data.bin", false, 10_000).unwrap();
  assert_eq!(vol.stat(file).unwrap().allocation_size, 12_288);
  let data = pattern(10_000, 0x5a);
  vol.write(file, 0, &data).unwrap();
  assert_eq!(vol.read(file, 0, 10_000).unwrap(), data);

  let free = vol.stats().free_blocks;
  vol.set_end_of_file(file, 6000).unwrap();
  let info = vol.stat(file).unwrap();
  assert_eq!(info.size, 6000);
  assert_eq!(info.allocation_size, 8192);
  assert_eq!(vol.stats().free_blocks, free + 1);
  assert_eq!(vol.read(file, 0, 10_000).unwrap(), data[..6000].to_vec());
  vol.close(file).unwrap();
  vol.verify().unwrap();
}

#[test]
fn files_survive_a_remount() {
  init();
  let tf = NamedTempFile::new().unwrap();
  let mut vol = formatted(&tf);
  let root = vol.root();
  let dir = vol.create_file(root, "Cache", true, 0).unwrap();
  let file = vol.create_file(dir, "tile.dat", false, 0).unwrap();
  let data = pattern(3 * BLOCK_SIZE + 17, 0x11);
  vol.write(file, 0, &data).unwrap();
  vol.close(file).unwrap();
  vol.close(dir).unwrap();
  let serial = vol.header().serial;
  let free = vol.stats().free_blocks;
  vol.unmount().unwrap();

  let emu = FileBlockEmulator::open_disk(tf.path()).unwrap();
  assert_eq!(emu.len(), (IMAGE_BLOCKS * BLOCK_SIZE) as u64);
  let mut vol = FatxVolume::mount(emu, VolumeConfig::default()).unwrap();
  assert_eq!(vol.header().serial, serial);
  assert_eq!(vol.stats().free_blocks, free);

  let file = vol.open("/Cache/tile.dat").unwrap();
  let info = vol.stat(file).unwrap();
  assert_eq!(info.size, data.len() as u64);
  assert_eq!(info.allocation_size, 4 * BLOCK_SIZE as u64);
  assert_eq!(vol.read(file, 0, data.len()).unwrap(), data);
  vol.close(file).unwrap();
  vol.verify().unwrap();
}

#[test]
fn interleaved_growth_stays_readable() {
  init();
  let tf = NamedTempFile::new().unwrap();
  let mut vol = formatted(&tf);
  let root = vol.root();
  let a = vol.create_file(root, "a", false, 0).unwrap();
  let b = vol.create_file(root, "b", false, 0).unwrap();

  // Alternate appends so both chains end up fragmented.
  let chunk = BLOCK_SIZE + 100;
  for round in 0..6 {
    let offset = (round * chunk) as u64;
    vol.write(a, offset, &pattern(chunk, round as u8)).unwrap();
    vol.write(b, offset, &pattern(chunk, 0x80 | round as u8)).unwrap();
  }
  assert!(!vol.stat(a).unwrap().contiguous);

  for round in (0..6).rev() {
    let offset = (round * chunk) as u64;
    assert_eq!(vol.read(a, offset, chunk).unwrap(), pattern(chunk, round as u8));
    assert_eq!(
      vol.read(b, offset, chunk).unwrap(),
      pattern(chunk, 0x80 | round as u8)
    );
  }
  vol.close(a).unwrap();
  vol.close(b).unwrap();
}

#[test]
fn deleted_files_leave_no_trace() {
  init();
  let tf = NamedTempFile::new().unwrap();
  let mut vol = formatted(&tf);
  let root = vol.root();
  let free = vol.stats().free_blocks;
  let file = vol.create_file(root, "temp", false, 0).unwrap();
  vol.write(file, 0, &pattern(5 * BLOCK_SIZE, 3)).unwrap();
  vol.mark_for_deletion(file).unwrap();
  assert!(matches!(
    vol.create_file(root, "temp", false, 0),
    Err(XcfsError::AlreadyExists)
  ));
  vol.close(file).unwrap();
  assert_eq!(vol.stats().free_blocks, free);

  let again = vol.create_file(root, "temp", false, 0).unwrap();
  assert_eq!(vol.stat(again).unwrap().size, 0);
  vol.close(again).unwrap();
  assert_eq!(vol.read_dir(root).unwrap().len(), 1);
}

#[test]
fn unformatted_image_is_rejected() {
  init();
  let tf = NamedTempFile::new().unwrap();
  let emu = FileBlockEmulatorBuilder::from(tf.reopen().unwrap())
    .with_block_count(IMAGE_BLOCKS)
    .build()
    .unwrap();
  let err = FatxVolume::mount(emu, VolumeConfig::default()).err().unwrap();
  assert!(err.is_fatal());
}

#[test]
fn large_tables_page_through_a_small_cache() {
  init();
  let tf = NamedTempFile::new().unwrap();
  // 96 MiB gives a twelve-page table, more than the cache holds.
  let emu = FileBlockEmulatorBuilder::from(tf.reopen().unwrap())
    .with_block_count(24 * 1024)
    .build()
    .unwrap();
  let config = VolumeConfig::builder().cache_capacity(8).build().unwrap();
  let mut vol = FatxVolume::format(emu, config.clone()).unwrap();
  let root = vol.root();
  let free = vol.stats().free_blocks;
  let file = vol.create_file(root, "spread.bin", false, 0).unwrap();
  let clusters = 20_000u64;
  vol
    .set_allocation_size(file, clusters * BLOCK_SIZE as u64, false)
    .unwrap();
  vol.write(file, 0, b"head").unwrap();
  vol.close(file).unwrap();
  assert!(vol.stats().cache.evictions > 0);
  vol.verify().unwrap();
  vol.unmount().unwrap();

  let emu = FileBlockEmulator::open_disk(tf.path()).unwrap();
  let mut vol = FatxVolume::mount(emu, config).unwrap();
  assert_eq!(vol.stats().free_blocks, free - clusters as u32);
  vol.verify().unwrap();
  let file = vol.open("spread.bin").unwrap();
  assert_eq!(
    vol.stat(file).unwrap().allocation_size,
    clusters * BLOCK_SIZE as u64
  );
  assert_eq!(vol.read(file, 0, 4).unwrap(), b"head".to_vec());
  vol.set_end_of_file(file, 0).unwrap();
  vol.close(file).unwrap();
  assert_eq!(vol.stats().free_blocks, free);
  vol.verify().unwrap();
}
