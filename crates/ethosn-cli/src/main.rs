//! `ethosn` — command-line interface for Ethos-N command streams.
//!
//! ```text
//! USAGE:
//!   ethosn inspect <stream.bin>         Dump a binary command stream as XML
//!   ethosn to-binary <stream.xml>       Assemble XML back into binary
//!   ethosn extract-cmm <dump.txt>       Binding table + stream from a CMM dump
//!   ethosn caps <variant>               Print a hardware variant's capability table
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ethosn_chip::{EthosN78Variant, HardwareCapabilities};
use ethosn_command_stream::{cmm::CmmDump, read_stream, write_stream, xml};

#[derive(Parser)]
#[command(name = "ethosn", about = "Ethos-N command stream tooling", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Dump a binary command stream as XML.
    Inspect {
        /// Path to the binary stream.
        stream: PathBuf,
    },
    /// Assemble an XML stream back into binary.
    ToBinary {
        /// Path to the XML text.
        xml: PathBuf,
        /// Output path; defaults to the input with a .bin extension.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Extract the binding table and command stream from a CMM hex dump.
    ExtractCmm {
        /// Path to the dump text.
        dump: PathBuf,
        /// Also write the extracted stream bytes here.
        #[arg(short, long)]
        stream_out: Option<PathBuf>,
    },
    /// Print the capability table of a named hardware variant.
    Caps {
        /// Variant, e.g. 4tops-4ple.
        variant: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Inspect { stream } => cmd_inspect(&stream)?,
        Cmd::ToBinary { xml, output } => cmd_to_binary(&xml, output)?,
        Cmd::ExtractCmm { dump, stream_out } => cmd_extract_cmm(&dump, stream_out)?,
        Cmd::Caps { variant } => cmd_caps(&variant)?,
    }

    Ok(())
}

fn cmd_inspect(path: &PathBuf) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let stream = read_stream(&bytes).context("parsing command stream")?;

    println!("{}", xml::write_xml(&stream));
    Ok(())
}

fn cmd_to_binary(path: &PathBuf, output: Option<PathBuf>) -> Result<()> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let stream = xml::read_xml(&text).context("parsing XML")?;
    let bytes = write_stream(&stream);

    let output = output.unwrap_or_else(|| path.with_extension("bin"));
    std::fs::write(&output, &bytes).with_context(|| format!("writing {}", output.display()))?;
    println!("{} bytes -> {}", bytes.len(), output.display());
    Ok(())
}

fn cmd_extract_cmm(path: &PathBuf, stream_out: Option<PathBuf>) -> Result<()> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let dump = CmmDump::parse(&text).context("parsing CMM dump")?;

    let table = dump.extract_binding_table().context("extracting binding table")?;
    println!("Binding table: {} buffer(s)", table.len());
    for entry in &table {
        println!(
            "  [{}] {:#010x}  {:>8} B  {}",
            entry.id,
            entry.address,
            entry.size,
            entry.kind.name()
        );
    }

    if let Some(out) = stream_out {
        let bytes = dump
            .extract_command_stream()
            .context("extracting command stream")?;
        std::fs::write(&out, &bytes).with_context(|| format!("writing {}", out.display()))?;
        println!("Command stream: {} bytes -> {}", bytes.len(), out.display());
    }

    Ok(())
}

fn cmd_caps(variant: &str) -> Result<()> {
    let variant = match variant.to_lowercase().as_str() {
        "1tops-2ple" | "1tops" => EthosN78Variant::Ethos78_1Tops_2PleRatio,
        "2tops-2ple" | "2tops" => EthosN78Variant::Ethos78_2Tops_2PleRatio,
        "4tops-2ple" => EthosN78Variant::Ethos78_4Tops_2PleRatio,
        "4tops-4ple" | "4tops" => EthosN78Variant::Ethos78_4Tops_4PleRatio,
        "8tops-2ple" | "8tops" => EthosN78Variant::Ethos78_8Tops_2PleRatio,
        other => bail!("unknown variant '{other}'"),
    };

    let caps = HardwareCapabilities::from_variant(variant);
    println!("{variant:?}");
    println!("  Engines        {}", caps.num_engines);
    println!("  SRAM           {} KB total", caps.total_sram_bytes / 1024);
    println!(
        "  OGs/IGs        {} / {} per engine",
        caps.ogs_per_engine, caps.igs_per_engine
    );
    println!("  PLE lanes      {}", caps.ple_lanes);
    println!(
        "  Stripe limits  {} MCE/PLE, {} IFM+WGT/PLE",
        caps.max_mce_stripes_per_ple_stripe, caps.max_ifm_and_wgt_stripes_per_ple_stripe
    );
    println!(
        "  Versions       {} ..= {}",
        caps.supported_versions.min, caps.supported_versions.max
    );
    Ok(())
}
