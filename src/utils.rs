//! 通用工具函数

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

/// 生成连接 ID
///
/// 16 字节随机数的 URL-safe Base64 编码（无填充），作为逻辑连接的多路复用键，
/// 在连接生命周期内不可变
pub fn new_connection_id() -> String {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// 生成服务实例 ID（用于日志和指标标注）
pub fn new_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试：连接 ID 唯一且不含 URL 保留字符
    #[test]
    fn test_connection_id_shape() {
        let a = new_connection_id();
        let b = new_connection_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 22);
        assert!(!a.contains('+') && !a.contains('/') && !a.contains('='));
    }
}
