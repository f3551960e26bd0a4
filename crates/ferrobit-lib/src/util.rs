use rand::distributions::Alphanumeric;
use rand::Rng;

/// Azureus-style client tag that starts every peer ID we generate
pub const CLIENT_TAG: &[u8; 8] = b"-FB0100-";

/// A fresh peer ID: [`CLIENT_TAG`] followed by 12 random alphanumeric characters
pub fn generate_peer_id() -> [u8; 20] {
    let mut rng = rand::thread_rng();
    let mut peer_id = [0; 20];
    peer_id[..CLIENT_TAG.len()].copy_from_slice(CLIENT_TAG);
    for byte in peer_id[CLIENT_TAG.len()..].iter_mut() {
        *byte = rng.sample(Alphanumeric);
    }
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_the_client_tag_and_a_random_suffix() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[..8], CLIENT_TAG);
        assert!(peer_id[8..].iter().all(u8::is_ascii_alphanumeric));
        assert_ne!(generate_peer_id(), peer_id);
    }
}
