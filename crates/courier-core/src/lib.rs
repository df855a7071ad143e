//! Client library for a decentralized, end-to-end-encrypted messaging
//! protocol.
//!
//! The crate is organized around a handful of layers:
//!
//! - [`identity`]: wallet signing, signed key bundles, and the shared-secret
//!   derivations (triple-DH for messages, pre-key ECDH for invitations).
//! - [`crypto`]: the AES-256-GCM + HKDF envelope every payload is sealed in.
//! - [`transport`]: the network seam. Envelopes, paginated queries, and
//!   subscriptions behind the [`transport::Transport`] trait, with a full
//!   in-memory implementation for tests and demos.
//! - [`message`] / [`invitation`]: the two wire formats and the sealed
//!   invitation protocol that establishes private topics.
//! - [`conversation`] / [`conversations`]: the user-facing API. A
//!   [`client::Client`] lists, creates, and streams conversations; each
//!   [`conversation::Conversation`] sends and reads messages.
//! - [`consent`]: the replicated, self-encrypted consent list.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use courier_core::{Client, LocalWallet};
//! use courier_core::transport::memory::InMemoryTransport;
//!
//! # async fn demo() -> courier_core::Result<()> {
//! let transport = Arc::new(InMemoryTransport::new());
//! let wallet = LocalWallet::generate()?;
//! let client = Client::create(&wallet, transport).await?;
//!
//! let conversation = client
//!     .new_conversation("0x3F11b27F323b62B159D2642964fa27C46C841897", None)
//!     .await?;
//! conversation.send_text(&client, "gm").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod consent;
pub mod conversation;
pub mod conversations;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod invitation;
pub mod message;
pub mod time;
pub mod topic;
pub mod transport;

pub use client::Client;
pub use codec::{ContentCodec, ContentTypeId, EncodedContent, TextCodec};
pub use consent::{ConsentListEntry, ConsentState, PrivatePreferencesAction};
pub use conversation::{Conversation, DecodedMessage, MessageStream};
pub use conversations::ConversationStream;
pub use error::{CourierError, Result};
pub use identity::{
    EncryptedPrivateKeyBundle, LocalWallet, PrivateKeyBundle, PublicKeyBundle, WalletSigner,
};
pub use invitation::{InvitationContext, InvitationV1, SealedInvitation};
pub use transport::{Envelope, Transport};
