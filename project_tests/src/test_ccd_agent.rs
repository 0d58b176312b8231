use anyhow::{Context, Result, bail};
use clap::Parser;
use lib_common::ingest::SectionName;
use lib_common::ingest::extractor::extract_header;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Sends one agent message to a CCD ingestion server", long_about = None)]
struct Args {
    /// Server host name or address
    host: String,

    /// Server port
    port: u16,

    /// Routing header, e.g. dashboard/pts/treatment
    header: String,

    /// Section bodies; each file is named after its section (IT.txt, PPVS.txt, ...)
    files: Vec<PathBuf>,
}

/// Section name taken from a file stem, e.g. `ppvs.txt` -> `PPVS`.
fn section_for(path: &Path) -> Result<SectionName> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .with_context(|| format!("no file name in {}", path.display()))?;
    stem.to_uppercase()
        .parse::<SectionName>()
        .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
}

/// Wraps each body as `NAME:{\n<body>}\n` after the header line.
fn build_message(header: &str, sections: &[(SectionName, String)]) -> String {
    let mut message = format!("{}\n", header);
    for (name, body) in sections {
        message.push_str(name.as_str());
        message.push_str(":{\n");
        message.push_str(body);
        if !body.is_empty() && !body.ends_with('\n') {
            message.push('\n');
        }
        message.push_str("}\n");
    }
    message
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Err(e) = extract_header(&args.header) {
        bail!("{}", e);
    }

    let mut sections = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let name = section_for(path)?;
        let body = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        sections.push((name, body));
    }
    let message = build_message(&args.header, &sections);

    let addr = format!("{}:{}", args.host, args.port);
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .with_context(|| format!("connecting to {} timed out", addr))?
        .with_context(|| format!("connecting to {}", addr))?;

    stream.write_all(message.as_bytes()).await?;
    stream.shutdown().await?;

    println!("Sent {} bytes ({} section(s)) to {}", message.len(), sections.len(), addr);
    Ok(())
}
