//! 帧编解码模块
//!
//! 把字节流切分 / 拼接为离散消息，两种帧格式：
//! - 文本帧：载荷 + 单字节记录分隔符（0x1E），握手帧与 JSON 协议帧都走这条路
//! - 二进制帧：7-bit 变长整数长度前缀 + 载荷
//!
//! 解析器是增量式的：一个缓冲区里的多个完整帧会被逐个取出，
//! 半截帧的状态保留在缓冲区中等待下一次网络读取补齐，不会对不完整输入报错

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{HubError, Result};

/// 文本帧记录分隔符
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// 变长整数长度前缀最多占用的字节数（u32 长度上限）
const MAX_LENGTH_PREFIX_SIZE: usize = 5;

/// 文本帧编解码
pub struct TextFraming;

impl TextFraming {
    /// 写出一个文本帧：载荷后附加记录分隔符
    pub fn write(payload: &[u8], out: &mut BytesMut) {
        out.reserve(payload.len() + 1);
        out.put_slice(payload);
        out.put_u8(RECORD_SEPARATOR);
    }

    /// 从缓冲区取出下一个完整文本帧
    ///
    /// 找不到分隔符说明输入不完整，返回 `None`，已有字节原样保留
    pub fn try_parse(buf: &mut BytesMut) -> Option<Bytes> {
        let position = buf.iter().position(|b| *b == RECORD_SEPARATOR)?;
        let payload = buf.split_to(position).freeze();
        buf.advance(1);
        Some(payload)
    }
}

/// 二进制帧编解码
///
/// 长度前缀是 little-endian 7-bit 分组的变长整数，最高位为续位标记
pub struct BinaryFraming {
    max_length: usize,
}

impl BinaryFraming {
    /// 创建二进制帧编解码器，`max_length` 是允许声明的最大载荷长度
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    /// 写出一个二进制帧：变长长度前缀 + 载荷
    pub fn write(payload: &[u8], out: &mut BytesMut) {
        let mut length = payload.len();
        out.reserve(payload.len() + MAX_LENGTH_PREFIX_SIZE);
        loop {
            let mut byte = (length & 0x7F) as u8;
            length >>= 7;
            if length > 0 {
                byte |= 0x80;
            }
            out.put_u8(byte);
            if length == 0 {
                break;
            }
        }
        out.put_slice(payload);
    }

    /// 从缓冲区取出下一个完整二进制帧
    ///
    /// 返回 `Ok(None)` 表示输入不完整；长度前缀本身非法（超过 5 字节仍未终止）
    /// 或声明长度超过上限时返回 `FramingError`，该错误对连接致命
    pub fn try_parse(&self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        let mut length: usize = 0;
        let mut prefix_size = 0;

        loop {
            if prefix_size >= buf.len() {
                // 前缀本身还没读全
                return Ok(None);
            }
            let byte = buf[prefix_size];
            length |= ((byte & 0x7F) as usize) << (7 * prefix_size);
            prefix_size += 1;

            if byte & 0x80 == 0 {
                break;
            }
            if prefix_size >= MAX_LENGTH_PREFIX_SIZE {
                return Err(HubError::framing(
                    "binary frame length prefix is malformed",
                ));
            }
        }

        if length > self.max_length {
            return Err(HubError::framing(format!(
                "binary frame of {length} bytes exceeds the maximum of {} bytes",
                self.max_length
            )));
        }

        if buf.len() < prefix_size + length {
            return Ok(None);
        }

        buf.advance(prefix_size);
        Ok(Some(buf.split_to(length).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试：文本帧写出后可解析回原载荷
    #[test]
    fn test_text_round_trip() {
        let mut buf = BytesMut::new();
        TextFraming::write(b"{}", &mut buf);
        TextFraming::write(b"{\"type\":6}", &mut buf);

        assert_eq!(TextFraming::try_parse(&mut buf).as_deref(), Some(&b"{}"[..]));
        assert_eq!(
            TextFraming::try_parse(&mut buf).as_deref(),
            Some(&b"{\"type\":6}"[..])
        );
        assert!(TextFraming::try_parse(&mut buf).is_none());
    }

    /// 测试：跨网络读取拆分的文本帧能增量补齐
    #[test]
    fn test_text_incremental() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{\"type\"");
        assert!(TextFraming::try_parse(&mut buf).is_none());
        assert_eq!(buf.len(), 7);

        buf.extend_from_slice(b":6}\x1e");
        assert_eq!(
            TextFraming::try_parse(&mut buf).as_deref(),
            Some(&b"{\"type\":6}"[..])
        );
        assert!(buf.is_empty());
    }

    /// 测试：二进制帧往返，包括需要两字节前缀的长度
    #[test]
    fn test_binary_round_trip() {
        let framing = BinaryFraming::new(1024 * 1024);
        let payload = vec![0xAB; 300];

        let mut buf = BytesMut::new();
        BinaryFraming::write(&payload, &mut buf);
        // 300 = 0xAC 0x02
        assert_eq!(&buf[..2], &[0xAC, 0x02]);

        let parsed = framing.try_parse(&mut buf).expect("valid frame");
        assert_eq!(parsed.as_deref(), Some(&payload[..]));
        assert!(buf.is_empty());
    }

    /// 测试：二进制帧在长度前缀或载荷截断时返回不完整而不是错误
    #[test]
    fn test_binary_incremental() {
        let framing = BinaryFraming::new(1024 * 1024);
        let mut full = BytesMut::new();
        BinaryFraming::write(&[1, 2, 3, 4, 5], &mut full);

        let mut buf = BytesMut::new();
        for byte in full.iter() {
            assert!(framing.try_parse(&mut buf).expect("no error").is_none() || buf.is_empty());
            buf.put_u8(*byte);
        }
        let parsed = framing.try_parse(&mut buf).expect("valid frame");
        assert_eq!(parsed.as_deref(), Some(&[1u8, 2, 3, 4, 5][..]));
    }

    /// 测试：声明长度超过上限属于帧格式错误（资源耗尽防护）
    #[test]
    fn test_binary_oversized_length_is_error() {
        let framing = BinaryFraming::new(16);
        let mut buf = BytesMut::new();
        BinaryFraming::write(&[0u8; 17], &mut buf);

        assert!(matches!(
            framing.try_parse(&mut buf),
            Err(HubError::Framing(_))
        ));
    }

    /// 测试：长度前缀超过 5 字节仍未终止属于帧格式错误
    #[test]
    fn test_binary_malformed_prefix_is_error() {
        let framing = BinaryFraming::new(1024);
        let mut buf = BytesMut::from(&[0x80u8, 0x80, 0x80, 0x80, 0x80, 0x80][..]);

        assert!(matches!(
            framing.try_parse(&mut buf),
            Err(HubError::Framing(_))
        ));
    }
}
