use clap::{Parser, Subcommand};
use dre::DreError;
use dre::archive::ArchiveReader;
use dre::array::StoredArray;
use dre::cutout::CutoutRecord;
use dre::result::Summary;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "archive_util")]
#[command(about = "Inspect dre archives", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the keys of an archive
    Keys { path: PathBuf },
    /// Show the shape of every array entry (model, PSF and score archives)
    Shapes { path: PathBuf },
    /// Show one cutout of an input archive
    Cutout { path: PathBuf, key: String },
    /// Print the rows of a summary table
    Summary { path: PathBuf },
}

fn main() -> Result<(), DreError> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Keys { path } => {
            let reader: ArchiveReader<StoredArray<f32>> = ArchiveReader::open(&path)?;
            for key in reader.keys() {
                println!("{}", key);
            }
            println!("{} entries", reader.len());
        }
        Commands::Shapes { path } => {
            let mut reader: ArchiveReader<StoredArray<f32>> = ArchiveReader::open(&path)?;
            for key in reader.keys().to_vec() {
                match reader.get(&key)? {
                    Some(entry) => println!("{:<16} {:?}", key, entry.shape),
                    None => println!("{:<16} missing", key),
                }
            }
        }
        Commands::Cutout { path, key } => {
            let mut reader: ArchiveReader<CutoutRecord> = ArchiveReader::open(&path)?;
            let Some(record) = reader.get(&key)? else {
                return Err(DreError::Archive(format!("no cutout {} in {}", key, path.display())));
            };
            let masked = record.seg.data.iter().filter(|&&s| s).count();
            let flux: f32 = record
                .obj
                .data
                .iter()
                .zip(&record.seg.data)
                .filter(|&(_, &s)| s)
                .map(|(v, _)| v)
                .sum();
            println!("{}: shape {:?}, {} masked pixels, masked flux {:.4}", key, record.obj.shape, masked, flux);
        }
        Commands::Summary { path } => {
            let rows = Summary::load(&path)?;
            for row in &rows {
                println!("{}", serde_json::to_string(row)?);
            }
            println!("{} rows", rows.len());
        }
    }
    Ok(())
}
