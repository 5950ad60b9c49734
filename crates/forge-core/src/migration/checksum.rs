//! 마이그레이션 내용 체크섬.

use sha2::{Digest, Sha256};

/// 파일 내용의 SHA-256 hex 다이제스트.
///
/// 줄바꿈(CRLF)을 LF로 정규화한 뒤 계산하므로 체크아웃 환경에 따라
/// 체크섬이 달라지지 않습니다.
pub fn checksum(content: &str) -> String {
    let normalized = content.replace("\r\n", "\n");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}
