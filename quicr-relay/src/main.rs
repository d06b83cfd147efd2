use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::future::BoxFuture;

use quicr_core::error::{Error, Result as CoreResult};
use quicr_core::node::Node;
use quicr_core::quic::TransportParams;
use quicr_core::relay;
use quicr_core::session;

mod quic;
mod tls;

use quic::QuinnConnection;

/// Runs a quicr node: an origin (serves only locally-published URLs) unless
/// `--upstream` names a relay/origin to pull unknown URLs from.
#[derive(Parser, Clone)]
struct Cli {
	/// Listen for QUIC connections on this address.
	#[arg(short, long, default_value = "[::]:853")]
	addr: SocketAddr,

	/// TLS certificate (PEM) for this node's identity.
	#[arg(short, long, default_value = "cert/localhost.crt")]
	cert: PathBuf,

	/// TLS private key (PEM) matching `--cert`.
	#[arg(short, long, default_value = "cert/localhost.key")]
	key: PathBuf,

	/// Upstream relay/origin to pull unknown URLs from and push local
	/// publishes to (spec.md §4.6 relay mode). Omit to run as an origin.
	#[arg(long)]
	upstream: Option<SocketAddr>,

	/// How long a real-time cache retains a received object, in microseconds.
	#[arg(long, default_value_t = 10_000_000)]
	cache_duration_max: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	env_logger::init();

	// Quinn is chatty below WARN; keep it quiet so our own logs aren't buried.
	let tracer = tracing_subscriber::FmtSubscriber::builder().with_max_level(tracing::Level::WARN).finish();
	tracing::subscriber::set_global_default(tracer).unwrap();

	let args = Cli::parse();
	let endpoint = build_endpoint(&args)?;

	let node = match args.upstream {
		Some(upstream) => {
			let endpoint = endpoint.clone();
			let connect: Arc<dyn Fn() -> BoxFuture<'static, CoreResult<QuinnConnection>> + Send + Sync> =
				Arc::new(move || Box::pin(connect_upstream(endpoint.clone(), upstream)));
			relay::build_node(args.cache_duration_max, connect)
		}
		None => Node::new(args.cache_duration_max),
	};

	log::info!("listening on {}", args.addr);

	loop {
		let incoming = endpoint.accept().await.context("endpoint closed")?;
		let node = node.clone();
		tokio::spawn(async move {
			let conn = match incoming.await {
				Ok(conn) => QuinnConnection::new(conn),
				Err(err) => {
					log::debug!("failed to establish connection: {err}");
					return;
				}
			};
			if let Err(err) = session::Connection::new(conn, node).run().await {
				log::info!("connection ended: {err}");
			}
		});
	}
}

fn build_endpoint(args: &Cli) -> anyhow::Result<quinn::Endpoint> {
	let certs = tls::load_certs(&args.cert)?;
	let key = tls::load_key(&args.key)?;

	let mut server_crypto = rustls::ServerConfig::builder()
		.with_safe_defaults()
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.context("invalid certificate/key pair")?;
	server_crypto.alpn_protocols = vec![quicr_core::quic::ALPN.to_vec()];

	let transport = Arc::new(quic::transport_config(TransportParams::server()));
	let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(server_crypto));
	server_config.transport_config(transport);

	quinn::Endpoint::server(server_config, args.addr).context("failed to bind QUIC endpoint")
}

async fn connect_upstream(endpoint: quinn::Endpoint, addr: SocketAddr) -> CoreResult<QuinnConnection> {
	let mut client_crypto = quic::client_crypto();
	client_crypto.alpn_protocols = vec![quicr_core::quic::ALPN.to_vec()];

	let mut client_config = quinn::ClientConfig::new(Arc::new(client_crypto));
	client_config.transport_config(Arc::new(quic::transport_config(TransportParams::client())));

	let connecting = endpoint
		.connect_with(client_config, addr, "localhost")
		.map_err(|err| Error::internal(err.to_string()))?;
	let conn = connecting.await.map_err(|err| Error::internal(err.to_string()))?;
	Ok(QuinnConnection::new(conn))
}
