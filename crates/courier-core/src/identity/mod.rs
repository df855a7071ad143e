//! Identity layer: wallet signing and key bundles
//!
//! An identity is rooted in an Ethereum-style wallet key. The wallet signs a
//! long-lived identity key, which in turn signs a rotating pre-key. Peers
//! validate the chain and recover the wallet address from the identity
//! signature, so a bundle proves control of the address it claims.

pub mod bundle;
pub mod wallet;

pub use bundle::{
    EncryptedPrivateKeyBundle, PrivateKeyBundle, PublicKeyBundle, SignedPublicKey,
    UnsignedPublicKey,
};
pub use wallet::{LocalWallet, RecoverableSignature, WalletSigner};
