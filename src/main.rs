use clap::{Parser, Subcommand};
use flate2::Compression;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

use bgzf::block::{check_header, BLOCK_HEADER_LENGTH};
use bgzf::{has_eof_marker, is_bgzf, BgzfReader, BgzfWriter, VirtualOffset};
use byteorder::{ByteOrder, LittleEndian};

#[derive(Parser)]
#[command(name = "bgzip", about = "Blocked-gzip container utility")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress a file into a blocked-gzip container
    Compress {
        input: PathBuf,
        /// Output path (default: INPUT.gz)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Compression level 0-9 (0 stores blocks uncompressed)
        #[arg(short, long, default_value = "6")]
        level: u32,
        /// Store blocks uncompressed (same as --level 0)
        #[arg(short = 'u', long)]
        uncompressed: bool,
        /// Worker threads for parallel compression (1 = single-threaded)
        #[arg(short, long, default_value = "1")]
        threads: usize,
        /// Blocks buffered per worker before a batch is dispatched
        #[arg(long, default_value = "64")]
        blocks_per_thread: usize,
    },
    /// Decompress a container back to raw bytes
    Decompress {
        input: PathBuf,
        /// Output path (default: INPUT without its extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check container magic, end-of-stream marker, and block integrity
    Test {
        input: PathBuf,
    },
    /// List every block with its virtual offset and sizes
    Blocks {
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse().command {

        // ── Compress ─────────────────────────────────────────────────────────
        Commands::Compress { input, output, level, uncompressed, threads, blocks_per_thread } => {
            let out_path = output.unwrap_or_else(|| {
                let mut p = input.clone().into_os_string();
                p.push(".gz");
                PathBuf::from(p)
            });
            let level = if uncompressed {
                Compression::none()
            } else {
                Compression::new(level.min(9))
            };

            let mut src = File::open(&input)?;
            let mut writer = BgzfWriter::create(&out_path, level)?;
            if threads > 1 {
                writer.enable_pipeline(threads, blocks_per_thread)?;
            }

            let mut buf = vec![0u8; 1 << 16];
            let mut raw_bytes = 0u64;
            loop {
                let n = src.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                writer.write(&buf[..n])?;
                raw_bytes += n as u64;
            }
            writer.finish()?;

            let packed_bytes = std::fs::metadata(&out_path)?.len();
            println!(
                "{} -> {}  ({} B -> {} B)",
                input.display(),
                out_path.display(),
                raw_bytes,
                packed_bytes,
            );
        }

        // ── Decompress ───────────────────────────────────────────────────────
        Commands::Decompress { input, output } => {
            let out_path = output.unwrap_or_else(|| {
                let stripped = input.with_extension("");
                if stripped == input { input.with_extension("out") } else { stripped }
            });

            let mut reader = BgzfReader::open(&input)?;
            let mut dst = File::create(&out_path)?;
            let copied = io::copy(&mut reader, &mut dst)?;
            println!("{} -> {}  ({} B)", input.display(), out_path.display(), copied);
        }

        // ── Test ─────────────────────────────────────────────────────────────
        Commands::Test { input } => {
            let magic_ok = is_bgzf(&input);
            let eof_ok = has_eof_marker(&input);
            println!("  container magic  {}", if magic_ok { "ok" } else { "MISSING" });
            println!("  EOF marker       {}", if eof_ok { "ok" } else { "MISSING" });

            let mut reader = BgzfReader::open(&input)?;
            let mut buf = vec![0u8; 1 << 16];
            let mut payload_bytes = 0u64;
            let decode_err = loop {
                match reader.read(&mut buf) {
                    Ok(0) => break None,
                    Ok(n) => payload_bytes += n as u64,
                    Err(e) => break Some(e),
                }
            };
            match decode_err {
                None => println!("  payload          ok ({payload_bytes} B)"),
                Some(e) => println!("  payload          FAILED: {e}"),
            }

            if !magic_ok || !eof_ok || reader.errcode() != 0 {
                return Err("container failed verification".into());
            }
        }

        // ── Blocks ───────────────────────────────────────────────────────────
        Commands::Blocks { input } => {
            let mut f = File::open(&input)?;
            println!("{:>16} {:>12} {:>10} {:>10}", "voffset", "address", "on-disk", "raw");

            loop {
                let pos = f.stream_position()?;
                let mut header = [0u8; BLOCK_HEADER_LENGTH];
                match f.read_exact(&mut header) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }
                if !check_header(&header) {
                    return Err(format!("malformed block header at offset {pos}").into());
                }
                let length = u64::from(LittleEndian::read_u16(&header[16..18])) + 1;

                // ISIZE sits in the last 4 footer bytes.
                f.seek(SeekFrom::Start(pos + length - 4))?;
                let mut isize_buf = [0u8; 4];
                f.read_exact(&mut isize_buf)?;
                let raw_len = LittleEndian::read_u32(&isize_buf);

                let voffset = VirtualOffset::new(pos, 0)?;
                let note = if raw_len == 0 && length == 28 { "  (EOF marker)" } else { "" };
                println!("{:>16} {:>12} {:>10} {:>10}{}", voffset, pos, length, raw_len, note);
            }
        }
    }

    Ok(())
}
