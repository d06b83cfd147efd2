//! PEM cert/key loading for the server identity.
use std::fs;
use std::io::BufReader;
use std::path::Path;

use anyhow::Context;

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<rustls::Certificate>> {
	let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
	let mut reader = BufReader::new(file);
	let certs = rustls_pemfile::certs(&mut reader).context("failed to parse certificate")?;
	Ok(certs.into_iter().map(rustls::Certificate).collect())
}

pub fn load_key(path: &Path) -> anyhow::Result<rustls::PrivateKey> {
	let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
	let mut reader = BufReader::new(file);
	let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader).context("failed to parse private key")?;
	let key = keys.pop().context("no private key found")?;
	Ok(rustls::PrivateKey(key))
}
