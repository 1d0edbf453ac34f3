//! Cluster identifiers

use rand::Rng;

pub const CLUSTER_ID_LENGTH: usize = 15;

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A fresh random cluster id: 15 lowercase alphanumeric characters.
pub fn generate_cluster_id() -> String {
    let mut rng = rand::thread_rng();
    (0..CLUSTER_ID_LENGTH)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

pub fn is_valid_cluster_id(id: &str) -> bool {
    id.len() == CLUSTER_ID_LENGTH
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}
