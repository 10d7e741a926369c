use std::{path::PathBuf, sync::Arc};

use engine::{
    crypto::Sha256Digest,
    descriptor::Descriptor,
    torrent::Torrent,
    ClientIdentity, EngineConfig,
};

#[tokio::main]
async fn main() {
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub).unwrap();

    let descriptor_path = std::env::args().nth(1).expect("usage: engine <descriptor-path>");
    let digest = Arc::new(Sha256Digest);

    let config = EngineConfig {
        output_dir: PathBuf::from("downloads"),
        ..EngineConfig::default()
    };

    let descriptor = Descriptor::load(
        &PathBuf::from(descriptor_path),
        digest.as_ref(),
        None,
        None,
        config.min_piece_length,
        config.max_piece_length,
    )
    .expect("failed to load descriptor");

    tracing::info!(
        descriptor_id = descriptor.descriptor_id_hex(),
        size = descriptor.size_fmt(),
        "loaded descriptor"
    );

    // No tracker implementations are wired in here: the tracker client is an
    // external collaborator (see the `tracker` module), left to whatever
    // transport the embedding application brings.
    let mut torrent = Torrent::new(descriptor, config, ClientIdentity::default(), digest, vec![])
        .await
        .expect("failed to initialise torrent");

    if let Err(e) = torrent.run().await {
        tracing::error!("torrent exited with error: {}", e);
    }
}
