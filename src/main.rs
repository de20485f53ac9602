#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use ioboard_loader::config::{PatternTable, REGION_LEN};
use ioboard_loader::protocol::EEPROM_SIZE;
use ioboard_loader::{iob, DeviceImage, Options};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    command: Command,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Command {
    /// Decode an Intel HEX firmware file to a flat binary image
    Decode {
        /// Firmware file to decode
        input: PathBuf,

        /// Write the decoded image here
        #[structopt(long)]
        output: Option<PathBuf>,
    },

    /// Write the default pattern configuration to an .iob file
    Defaults {
        #[structopt(long)]
        output: PathBuf,
    },

    /// Print a pattern configuration
    Show {
        /// Configuration file
        #[structopt(long, conflicts_with = "image", required_unless = "image")]
        file: Option<PathBuf>,

        /// EEPROM image read from a board
        #[structopt(long)]
        image: Option<PathBuf>,
    },

    /// Encode an .iob file into an EEPROM image
    Pack {
        #[structopt(long)]
        file: PathBuf,

        #[structopt(long)]
        output: PathBuf,

        /// Existing EEPROM image to apply the configuration over
        #[structopt(long)]
        base: Option<PathBuf>,
    },

    /// Decode an EEPROM image into an .iob file
    Unpack {
        #[structopt(long)]
        image: PathBuf,

        #[structopt(long)]
        output: PathBuf,
    },

    /// Pulse the board reset line
    ResetBoard {
        /// Serial port to connect to
        #[structopt(long, default_value = "/dev/ttyUSB0")]
        port: String,

        #[structopt(flatten)]
        options: Options,
    },
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o.command) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Decode { input, output } => {
            let f = File::open(&input).with_context(|| format!("opening {}", input.display()))?;
            let total = f.metadata()?.len();

            let bar = ProgressBar::new(100);
            bar.set_style(ProgressStyle::default_bar().template("{msg} [{bar:40}] {percent}%"));
            bar.set_message("Reading hex file");

            let image = ioboard_loader::hex::decode_reader(BufReader::new(f), total, |p| {
                bar.set_position((p * 100.0) as u64)
            });
            bar.finish_and_clear();

            let image = image.with_context(|| format!("bad hex file {}", input.display()))?;
            info!("Decoded {} firmware image", bytefmt::format(image.len() as u64));

            match output {
                Some(path) => fs::write(&path, image.as_bytes())
                    .with_context(|| format!("writing {}", path.display()))?,
                None => dump(image.as_bytes()),
            }
        }
        Command::Defaults { output } => {
            let f = File::create(&output).with_context(|| format!("creating {}", output.display()))?;
            iob::write(&PatternTable::default(), BufWriter::new(f))?;
        }
        Command::Show { file, image } => {
            let table = match (file, image) {
                (Some(file), _) => load_table(&file)?,
                (None, Some(image)) => {
                    let image = load_image(&image)?;
                    dump(&image.as_bytes()[..REGION_LEN]);

                    let decoded = image.decode();
                    for e in &decoded.invalid {
                        warn!("{}", e);
                    }
                    decoded.table
                }
                (None, None) => return Err(anyhow!("either --file or --image is required")),
            };

            for (i, s) in table.iter() {
                println!("{:<10} {} 0x{:04X} {}", iob::slot_name(i), s.mask, s.mask.bits(), s.flight_mode);
            }
        }
        Command::Pack { file, output, base } => {
            let table = load_table(&file)?;

            let mut image = match base {
                Some(base) => load_image(&base)?,
                None => DeviceImage::default(),
            };
            image.apply(&table);

            fs::write(&output, image.as_bytes())
                .with_context(|| format!("writing {}", output.display()))?;
            info!("Wrote {} EEPROM image", bytefmt::format(EEPROM_SIZE as u64));
        }
        Command::Unpack { image, output } => {
            let decoded = load_image(&image)?.decode();
            for e in &decoded.invalid {
                warn!("{}", e);
            }

            let f = File::create(&output).with_context(|| format!("creating {}", output.display()))?;
            iob::write(&decoded.table, BufWriter::new(f))?;
        }
        Command::ResetBoard { port, options } => {
            info!("Resetting board on {}", port);

            let _port = ioboard_loader::linux::open(&port, &options)
                .map_err(|e| anyhow!("error connecting to serial port: {:?}", e))?;

            info!("Board reset");
        }
    }

    Ok(())
}

fn load_table(path: &Path) -> anyhow::Result<PatternTable> {
    let f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    iob::load(BufReader::new(f)).with_context(|| format!("reading {}", path.display()))
}

fn load_image(path: &Path) -> anyhow::Result<DeviceImage> {
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(DeviceImage::from_bytes(&data))
}

/// Print `data` as rows of 16 hex bytes
fn dump(data: &[u8]) {
    for (i, row) in data.chunks(16).enumerate() {
        println!("{:04x}: {}", i * 16, hex::encode(row));
    }
}
