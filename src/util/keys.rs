use sha2::{Digest, Sha256};

/// 由共享密钥派生出的密钥材料
///
/// 连接池只负责持有，具体用途交给分帧/认证相关的组件。
#[derive(Clone, PartialEq, Eq)]
pub struct Keys {
    bytes: [u8; 32],
    words: [u64; 4],
}

impl Keys {
    pub fn derive(secret: &str) -> Self {
        let bytes: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        let mut words = [0u64; 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            *word = u64::from_be_bytes(buf);
        }
        Self { bytes, words }
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn words(&self) -> &[u64; 4] {
        &self.words
    }

    /// 连接握手使用的认证标签: sha256(key_bytes || client_id)
    pub fn auth_tag(&self, client_id: u64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.bytes);
        hasher.update(client_id.to_be_bytes());
        hasher.finalize().into()
    }

    /// 日志里用的短指纹，不泄露完整密钥
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.bytes[..4])
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}
