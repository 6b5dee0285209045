// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 字符集清洗工具
//!
//! 输入快照、URI 解析与 XSS 清洗共用的底层函数：
//! 丢弃非法 UTF-8 序列、移除不可见控制字符，以及百分号解码。

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref INVISIBLE: Regex = Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]+").unwrap();
    static ref INVISIBLE_ENCODED: Regex = Regex::new(r"(?i)%0[0-8bcef]|%1[0-9a-f]").unwrap();
}

/// 判断字节串是否全部为 7 位 ASCII
pub fn is_ascii(bytes: &[u8]) -> bool {
    bytes.is_ascii()
}

/// 将字节串规整为合法的 UTF-8 字符串，非法序列被直接丢弃（不做替换）。
pub fn clean_string(bytes: &[u8]) -> String {
    if is_ascii(bytes) {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    bytes.utf8_chunks().map(|chunk| chunk.valid()).collect()
}

/// 移除不可见字符，防止 `Java\0script` 这类夹带空字符的载荷。
///
/// `url_encoded` 为真时同时移除这些字符的百分号编码形式。
/// 替换会一直重复直到没有匹配，因此 `%%0000` 这样的嵌套编码也会被清除。
pub fn remove_invisible_characters(input: &str, url_encoded: bool) -> String {
    let mut text = input.to_string();
    loop {
        let before = text.len();
        if url_encoded {
            text = INVISIBLE_ENCODED.replace_all(&text, "").into_owned();
        }
        text = INVISIBLE.replace_all(&text, "").into_owned();
        // 替换只会让字符串变短，长度不变即说明已无匹配
        if text.len() == before {
            return text;
        }
    }
}

/// 百分号解码。`plus_as_space` 为真时按表单编码把 `+` 解释为空格。
///
/// 不合法的转义序列原样保留。
pub fn url_decode(input: &str, plus_as_space: bool) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(high), Some(low)) => {
                        decoded.push(high << 4 | low);
                        i += 3;
                        continue;
                    }
                    _ => decoded.push(b'%'),
                }
            }
            b'+' if plus_as_space => decoded.push(b' '),
            other => decoded.push(other),
        }
        i += 1;
    }
    decoded
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
