use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{LevelFilter, debug, info};

use dwi_volume::{
    AxisFlips, DirectionTable, Modality, Volume, dsi_direction_field, dti_direction_field,
    odf_moment_map, signal_decay_map,
};

#[derive(Parser)]
#[command(
    name = "dwi-volume",
    version,
    about = "Diffusion-MRI post-processing: direction fields and scalar maps"
)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a per-voxel fiber direction field
    Direction {
        /// Reconstruction model of the dataset
        #[arg(long, value_parser = ["dti", "dsi"])]
        modality: String,

        /// Dataset path prefix: reads {prefix}v1.nii (dti) or {prefix}odf.nii
        /// plus {prefix}max.nii (dsi), writes {prefix}dir.nii
        #[arg(long)]
        prefix: String,

        /// ODF sampling directions file, dsi only
        #[arg(long)]
        dirlist: Option<PathBuf>,

        /// Drop maxima whose normalized amplitude is below this fraction
        #[arg(long, default_value_t = 0.0)]
        vf: f32,

        /// Invert the x component of every direction
        #[arg(long)]
        ix: bool,

        /// Invert the y component of every direction
        #[arg(long)]
        iy: bool,

        /// Invert the z component of every direction
        #[arg(long)]
        iz: bool,
    },

    /// Reduce a raw diffusion acquisition to a signal-decay map
    Decay {
        /// Diffusion-weighted input volume
        #[arg(long)]
        dwi: PathBuf,

        /// Output path prefix, writes {out}P0.nii
        #[arg(long)]
        out: String,

        /// Channel count the input must have
        #[arg(long, default_value_t = 515)]
        channels: usize,
    },

    /// Compute an ODF moment map: 2 = GFA, 3 = skewness, 4 = kurtosis
    Moment {
        /// Dataset path prefix: reads {prefix}odf.nii
        #[arg(long)]
        prefix: String,

        /// Moment to compute
        #[arg(long, default_value_t = 2)]
        m: u32,
    },
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Direction {
            modality,
            prefix,
            dirlist,
            vf,
            ix,
            iy,
            iz,
        } => {
            let modality = match modality.as_str() {
                "dti" => Modality::Dti,
                _ => Modality::Dsi,
            };
            if !(0.0..=1.0).contains(&vf) {
                return Err(format!("vf threshold {vf} outside [0, 1]").into());
            }
            if dirlist.is_some() && modality != Modality::Dsi {
                return Err("--dirlist only applies to dsi datasets".into());
            }
            let flips = AxisFlips { x: ix, y: iy, z: iz };
            match modality {
                Modality::Dti => direction_dti(&prefix, flips),
                Modality::Dsi => {
                    let table = dirlist.unwrap_or_else(|| PathBuf::from("181_vecs.dat"));
                    direction_dsi(&prefix, &table, vf, flips)
                }
            }
        }
        Command::Decay { dwi, out, channels } => decay(&dwi, &out, channels),
        Command::Moment { prefix, m } => moment(&prefix, m),
    }
}

fn direction_dti(prefix: &str, flips: AxisFlips) -> Result<(), Box<dyn Error>> {
    let input = format!("{prefix}v1.nii");
    info!("reading eigenvector volume {input}");
    let v1 = Volume::<f32>::open(&input)?;
    debug!("grid {:?}, voxel size {:?}", v1.shape(), &v1.header.pixdim[..3]);

    let field = dti_direction_field(&v1, flips)?;
    let output = format!("{prefix}dir.nii");
    field.save(&output)?;
    info!("wrote {output}");
    Ok(())
}

fn direction_dsi(
    prefix: &str,
    dirlist: &Path,
    vf: f32,
    flips: AxisFlips,
) -> Result<(), Box<dyn Error>> {
    let table = DirectionTable::load(dirlist)?;
    info!(
        "loaded {} sampling directions from {}",
        table.len(),
        dirlist.display()
    );

    let odf = Volume::<f32>::open(format!("{prefix}odf.nii"))?;
    let maxima = Volume::<i16>::open(format!("{prefix}max.nii"))?;
    debug!("ODF grid {:?}", odf.shape());

    let field = dsi_direction_field(&odf, &maxima, &table, flips, vf)?;
    let output = format!("{prefix}dir.nii");
    field.save(&output)?;
    info!("wrote {output}");
    Ok(())
}

fn decay(dwi_path: &Path, out: &str, channels: usize) -> Result<(), Box<dyn Error>> {
    info!("reading diffusion volume {}", dwi_path.display());
    let dwi = Volume::<i16>::open(dwi_path)?;

    let map = signal_decay_map(&dwi, channels)?;
    let output = format!("{out}P0.nii");
    map.save(&output)?;
    info!("wrote {output}");
    Ok(())
}

fn moment(prefix: &str, m: u32) -> Result<(), Box<dyn Error>> {
    let suffix = match m {
        2 => "gfa",
        3 => "skewness",
        4 => "kurtosis",
        other => return Err(format!("moment {other} outside 2..=4").into()),
    };
    let input = format!("{prefix}odf.nii");
    info!("reading ODF volume {input}");
    let odf = Volume::<f32>::open(&input)?;

    let map = odf_moment_map(&odf, m)?;
    let output = format!("{prefix}{suffix}.nii");
    map.save(&output)?;
    info!("wrote {output}");
    Ok(())
}
