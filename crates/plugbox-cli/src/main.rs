#![warn(clippy::pedantic)]

use std::{
    env::args,
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use anyhow::{Context as _, anyhow, bail};
use bytes::Bytes;
use plugbox::{
    ArchiveDescriptor, Config, Image, LoadRequest, Manifest, PluginService, ReadinessGate,
    StaticPolicy, checksum,
};
use tracing::info;

mod demo;
mod logging;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing()?;

    let args: Vec<String> = args().skip(1).collect();
    let task = args.first().map(String::as_str);
    match task {
        Some("pack") => pack(&args[1..]),
        Some("inspect") => inspect(&args[1..]),
        Some("run") => run(&args[1..]).await,
        None => bail!("usage: plugbox <pack|inspect|run> ..."),
        _ => Err(anyhow!("unknown task")),
    }
}

/// `pack <manifest.json> <out> [resource...]`: build an archive and its
/// checksum sidecar.
fn pack(args: &[String]) -> anyhow::Result<()> {
    let [manifest, out, resources @ ..] = args else {
        bail!("usage: plugbox pack <manifest.json> <out> [resource...]");
    };

    let manifest: Manifest = serde_json::from_slice(
        &fs::read(manifest).with_context(|| format!("reading {manifest}"))?,
    )
    .with_context(|| format!("parsing {manifest}"))?;

    let mut files = Vec::with_capacity(resources.len());
    for path in resources {
        let name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("bad resource path {path}"))?;
        files.push((name, fs::read(path).with_context(|| format!("reading {path}"))?));
    }
    let entries: Vec<(&str, &[u8])> = files.iter().map(|(n, d)| (*n, d.as_slice())).collect();

    let bytes = Image::encode(&manifest, &entries)?;
    let digest = checksum::digest(&bytes);
    let out = PathBuf::from(out);
    fs::write(&out, &bytes).with_context(|| format!("writing {}", out.display()))?;

    let file_name = out
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("bad output path {}", out.display()))?;
    let sidecar = out.with_file_name(checksum::sidecar_name(file_name));
    fs::write(&sidecar, &digest).with_context(|| format!("writing {}", sidecar.display()))?;

    info!(archive = %out.display(), %digest, resources = entries.len(), "packed");
    Ok(())
}

/// `inspect <archive>`: print the manifest and the sidecar checksum.
fn inspect(args: &[String]) -> anyhow::Result<()> {
    let [archive] = args else {
        bail!("usage: plugbox inspect <archive>");
    };
    let path = Path::new(archive);
    let file = File::open(path).with_context(|| format!("opening {archive}"))?;
    let image = Image::decode(archive, file)?;

    let sidecar = path.with_file_name(checksum::sidecar_name(
        path.file_name().and_then(|n| n.to_str()).unwrap_or(archive),
    ));
    let checksum = fs::read_to_string(sidecar).unwrap_or_default();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "archive": archive,
            "checksum": checksum,
            "manifest": image.manifest,
        }))?
    );
    Ok(())
}

/// `run <bundled-archive> <entry-point> [input]`: load a bundled archive from
/// the configured assets directory and execute it once.
async fn run(args: &[String]) -> anyhow::Result<()> {
    let (archive, entry_point, input) = match args {
        [archive, entry_point] => (archive, entry_point, String::new()),
        [archive, entry_point, input] => (archive, entry_point, input.clone()),
        _ => bail!("usage: plugbox run <bundled-archive> <entry-point> [input]"),
    };

    let config = Config::from_env();
    let gate = Arc::new(ReadinessGate::new());
    let service = PluginService::builder(config)
        .catalog(demo::catalog())
        .policy_provider(Arc::new(StaticPolicy::default()))
        .readiness(Arc::clone(&gate))
        .build();

    // Stands in for the host's connection loop, which owns readiness.
    let dispatch = thread::spawn(move || {
        gate.bind_dispatch_thread();
        gate.signal_ready()
    });

    let task_id = "cli";
    let ack = service
        .load(
            LoadRequest::new(task_id, entry_point.as_str())
                .archive(ArchiveDescriptor::bundled(archive.as_str())),
        )
        .await?;
    dispatch
        .join()
        .map_err(|_| anyhow!("dispatch thread panicked"))?;
    info!(
        combined_checksum = ack.combined_checksum.as_deref().unwrap_or("<unknown>"),
        "loaded"
    );

    let output = service.execute(task_id, Bytes::from(input)).await?;
    service.unload(task_id)?;
    println!("{}", String::from_utf8_lossy(&output));
    Ok(())
}
