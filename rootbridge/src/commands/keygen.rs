//! The `keygen` subcommand: generates a fresh RSA client identity for
//! pairing with the daemon and prints everything the browser-side client
//! needs (the private key to hold onto, the public JWK and kid to show the
//! operator while they wait in the approval queue).

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;

use rootbridge_core::crypto::{compute_kid, Jwk};

const KEY_BITS: usize = 2048;

pub(crate) async fn command() -> Result<()> {
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
        .context("failed to generate RSA key")?;
    let public_key = private_key.to_public_key();

    let jwk = Jwk {
        kty: "RSA".to_owned(),
        n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
    };
    let kid = compute_kid(&jwk);

    let pem = private_key
        .to_pkcs8_pem(Default::default())
        .context("failed to encode private key")?;

    println!("key id: {kid}");
    println!();
    println!("public key (share with the daemon operator for approval):");
    println!("{}", serde_json::to_string(&jwk)?);
    println!();
    println!("private key (keep this, the browser client signs challenges with it):");
    println!("{}", pem.as_str());
    Ok(())
}
