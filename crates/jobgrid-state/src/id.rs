//! Document identifiers.
//!
//! Ids are 24 lowercase hex characters: 12 for the creation time in
//! milliseconds followed by 12 random ones. They sort by creation time
//! across processes to millisecond resolution.

use jobgrid_core::epoch_millis;

use crate::error::{StateError, StateResult};

pub fn new_object_id() -> StateResult<String> {
    let mut random = [0u8; 6];
    getrandom::getrandom(&mut random).map_err(|e| StateError::Write(e.to_string()))?;
    let millis = epoch_millis() & 0xffff_ffff_ffff;
    Ok(format!("{millis:012x}{}", hex::encode(random)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_hex_and_fixed_width() {
        let id = new_object_id().unwrap();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_are_unique() {
        let a = new_object_id().unwrap();
        let b = new_object_id().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn ids_order_by_creation_time() {
        let earlier = new_object_id().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let later = new_object_id().unwrap();
        assert!(earlier < later);
    }
}
