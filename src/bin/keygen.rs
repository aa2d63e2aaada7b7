//! Ed25519 keypair generator for bundle substrate nodes.
//!
//! Usage:
//!   cargo run --bin keygen -- --name "relay-east" --output ./keys/

use clap::Parser;
use std::fs;
use std::path::PathBuf;
use waypost::Keypair;

#[derive(Parser)]
#[command(name = "keygen", version, about = "Waypost Ed25519 Key Generator")]
struct Args {
    /// Node name (used for the output filenames only)
    #[arg(short, long)]
    name: String,

    /// Output directory for keys
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
}

fn main() {
    let args = Args::parse();

    println!("════════════════════════════════════════════════════════════");
    println!("  Waypost Ed25519 Keypair Generator");
    println!("════════════════════════════════════════════════════════════");
    println!();
    println!("Generating keypair for: {}", args.name);
    println!();

    let keypair = Keypair::generate();
    let secret_bytes = keypair.secret_bytes();
    let public_bytes = *keypair.public_key();

    fs::create_dir_all(&args.output).expect("failed to create output directory");

    let secret_path = args.output.join(format!("{}_secret.key", args.name));
    fs::write(&secret_path, secret_bytes).expect("failed to write secret key");
    println!("Secret key saved to: {}", secret_path.display());
    println!("  Size: {} bytes", secret_bytes.len());
    println!();

    let public_path = args.output.join(format!("{}_public.key", args.name));
    fs::write(&public_path, public_bytes).expect("failed to write public key");
    println!("Public key saved to: {}", public_path.display());
    println!("  Size: {} bytes", public_bytes.len());
    println!();

    println!("════════════════════════════════════════════════════════════");
    println!("  Peer id (hex)");
    println!("════════════════════════════════════════════════════════════");
    println!();
    println!("{}", hex::encode(public_bytes));
    println!();

    println!("════════════════════════════════════════════════════════════");
    println!("  Verification test");
    println!("════════════════════════════════════════════════════════════");
    println!();
    let test_message = b"waypost keygen self-test";
    let signature = keypair.sign(test_message);
    let verified = {
        use ed25519_dalek::{Verifier, VerifyingKey};
        VerifyingKey::from_bytes(&public_bytes)
            .map(|vk| vk.verify(test_message, &ed25519_dalek::Signature::from_bytes(&signature)).is_ok())
            .unwrap_or(false)
    };
    if verified {
        println!("  Signature verification: PASSED");
    } else {
        println!("  Signature verification: FAILED");
        std::process::exit(1);
    }
    println!();

    println!("════════════════════════════════════════════════════════════");
    println!("  Security instructions");
    println!("════════════════════════════════════════════════════════════");
    println!();
    println!("1. Keep {}_secret.key out of version control.", args.name);
    println!("2. Load it at node startup via --key-file or a secret store.");
    println!("3. Distribute {}_public.key to peers that should add this node", args.name);
    println!("   to a keyring before they will accept or relay its bundles.");
    println!();
}
