//! Courier CLI
//!
//! Thin wrapper around courier-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Generate a wallet key and print its address
//! courier generate
//!
//! # Derive the address of an existing private key
//! courier address <private-key-hex>
//!
//! # Print the topic paths for an address
//! courier topics <address> [--peer <address>]
//!
//! # Run a local two-party conversation demo over the in-memory transport
//! courier demo
//! ```

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use courier_core::transport::memory::InMemoryTransport;
use courier_core::{topic, Client, LocalWallet, WalletSigner};
use tracing::{debug, info};

/// Courier - decentralized E2EE messaging
#[derive(Parser)]
#[command(name = "courier")]
#[command(version = "0.1.0")]
#[command(about = "Courier - decentralized E2EE messaging client")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new wallet key
    Generate,

    /// Derive the wallet address of a private key
    Address {
        /// Private key as 64 hex characters
        private_key: String,
    },

    /// Print the topic paths for an address
    Topics {
        /// Wallet address
        address: String,

        /// Peer address, to include the direct-message topic
        #[arg(long)]
        peer: Option<String>,
    },

    /// Run a local two-party conversation demo
    Demo,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

fn parse_wallet(private_key: &str) -> Result<LocalWallet> {
    let bytes = hex::decode(private_key.trim_start_matches("0x"))
        .map_err(|e| anyhow::anyhow!("Invalid hex format: {}", e))?;
    LocalWallet::from_bytes(&bytes).map_err(|e| anyhow::anyhow!("Invalid private key: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Generate => {
            let wallet = LocalWallet::generate()?;
            println!("Address:     {}", wallet.address());
            println!("Private key: {}", hex::encode(wallet.to_bytes()));
        }

        Commands::Address { private_key } => {
            let wallet = parse_wallet(&private_key)?;
            println!("{}", wallet.address());
        }

        Commands::Topics { address, peer } => {
            println!("Contact: {}", topic::contact(&address));
            println!("Intro:   {}", topic::intro(&address));
            println!("Invite:  {}", topic::invite(&address));
            if let Some(peer) = peer {
                println!("DM:      {}", topic::direct_message(&address, &peer));
            }
        }

        Commands::Demo => run_demo().await?,
    }

    Ok(())
}

/// Two clients talking over the in-memory transport.
async fn run_demo() -> Result<()> {
    info!("starting two-party demo over the in-memory transport");
    let transport = Arc::new(InMemoryTransport::new());

    let alice_wallet = LocalWallet::generate()?;
    let bob_wallet = LocalWallet::generate()?;
    let alice = Client::create(&alice_wallet, transport.clone()).await?;
    let bob = Client::create(&bob_wallet, transport).await?;
    println!("Alice: {}", alice.address());
    println!("Bob:   {}", bob.address());
    println!();

    let conversation = alice.new_conversation(bob.address(), None).await?;
    debug!(topic = %conversation.topic(), "conversation established");
    println!("Conversation topic: {}", conversation.topic());

    conversation.send_text(&alice, "gm bob").await?;
    conversation
        .send_text(&alice, "this never touches a server in the clear")
        .await?;

    // Bob discovers the conversation from his invite topic
    let listed = bob.list().await?;
    for conversation in &listed {
        println!();
        println!("Bob sees conversation with {}:", conversation.peer_address());
        let mut messages = conversation.messages(&bob).await?;
        messages.reverse();
        for message in messages {
            println!("  [{}] {}", message.sender_address, message.text()?);
            bob.allow(vec![message.sender_address]).await?;
        }
    }

    println!();
    println!(
        "Alice's consent for Bob: {:?}",
        alice.consent_state(bob.address())
    );
    println!(
        "Bob's consent for Alice: {:?}",
        bob.consent_state(alice.address())
    );
    Ok(())
}
