//! Topic path builders
//!
//! Topics are the network's addressing scheme and an external contract: every
//! string produced here must match what other client implementations derive
//! byte for byte, or peers stop seeing each other's traffic.

/// Topic path for a wallet's published contact bundle.
pub fn contact(wallet_address: &str) -> String {
    format!("/xmtp/0/contact-{}/proto", wallet_address)
}

/// Topic path carrying first-contact copies of direct messages.
pub fn intro(wallet_address: &str) -> String {
    format!("/xmtp/0/intro-{}/proto", wallet_address)
}

/// Topic path carrying sealed invitations addressed to a wallet.
pub fn invite(wallet_address: &str) -> String {
    format!("/xmtp/0/invite-{}/proto", wallet_address)
}

/// Topic path for a two-party direct message exchange. The address pair is
/// sorted so both parties derive the same topic.
pub fn direct_message(address_a: &str, address_b: &str) -> String {
    let (low, high) = if address_a <= address_b {
        (address_a, address_b)
    } else {
        (address_b, address_a)
    };
    format!("/xmtp/0/dm-{}-{}/proto", low, high)
}

/// Topic path for an invitation-established exchange, keyed by a derived or
/// random identifier.
pub fn message_v2(topic_id: &str) -> String {
    format!("/xmtp/0/m-{}/proto", topic_id)
}

/// Topic path for a wallet's encrypted private key backup.
pub fn private_store(wallet_address: &str) -> String {
    format!("/xmtp/0/privatestore-{}/key_bundle/proto", wallet_address)
}

/// Topic path for a wallet's encrypted preferences (consent list). The
/// identifier is derived from the identity key, not the wallet address, so
/// observers cannot correlate it.
pub fn user_preferences(identifier: &str) -> String {
    format!("/xmtp/0/userpreferences-{}/proto", identifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "0x1111111111111111111111111111111111111111";
    const BOB: &str = "0x2222222222222222222222222222222222222222";

    #[test]
    fn test_topic_paths() {
        assert_eq!(contact(ALICE), format!("/xmtp/0/contact-{ALICE}/proto"));
        assert_eq!(intro(ALICE), format!("/xmtp/0/intro-{ALICE}/proto"));
        assert_eq!(invite(ALICE), format!("/xmtp/0/invite-{ALICE}/proto"));
        assert_eq!(message_v2("abc123"), "/xmtp/0/m-abc123/proto");
        assert_eq!(
            private_store(ALICE),
            format!("/xmtp/0/privatestore-{ALICE}/key_bundle/proto")
        );
        assert_eq!(
            user_preferences("deadbeef"),
            "/xmtp/0/userpreferences-deadbeef/proto"
        );
    }

    #[test]
    fn test_direct_message_topic_is_order_independent() {
        let forward = direct_message(ALICE, BOB);
        let reverse = direct_message(BOB, ALICE);
        assert_eq!(forward, reverse);
        assert_eq!(forward, format!("/xmtp/0/dm-{ALICE}-{BOB}/proto"));
    }
}
