//! 会话层：session_id 与检查点谱系的映射、续接与回放

pub mod manager;

pub use manager::{SessionHandle, SessionManager};

/// 生成会话 id：v4 UUID 的前 12 个十六进制字符
pub fn new_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_shape() {
        let id = new_session_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
