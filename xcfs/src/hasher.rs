/// Width of the content digests stored in hash-tree entries and the volume
/// descriptor.
pub const DIGEST_LEN: usize = 20;

pub type Digest = [u8; DIGEST_LEN];

/// Content hash used for STFS integrity. The container layer injects the
/// console's own digest; the engine only compares what this returns.
pub trait BlockHasher: Send + Sync {
    fn digest(&self, data: &[u8]) -> Digest;

    fn name(&self) -> &'static str {
        "custom"
    }
}

/// BLAKE3 truncated to the 20-byte entry width.
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Hasher;

impl BlockHasher for Blake3Hasher {
    fn digest(&self, data: &[u8]) -> Digest {
        let full = blake3::hash(data);
        let mut out = [0; DIGEST_LEN];
        out.copy_from_slice(&full.as_bytes()[..DIGEST_LEN]);
        out
    }

    fn name(&self) -> &'static str {
        "blake3-160"
    }
}
