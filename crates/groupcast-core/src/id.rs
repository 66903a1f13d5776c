/// Generate a fresh identifier (UUID v4).
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
