use clap::Parser;

use h5read::{Error, Hdf5File, OpenOptions};

/// Inspect an HDF5 file: print its decoded tree, or dump one dataset.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Params {
    /// File to inspect
    path: std::path::PathBuf,

    /// Dataset to read and print, as a /-separated path inside the file
    #[arg(short, long)]
    dataset: Option<String>,

    /// Keep going when a metadata checksum does not match
    #[arg(long)]
    ignore_checksums: bool,
}

fn main() {
    env_logger::init();
    let args = Params::parse();
    if let Err(e) = run(&args) {
        eprintln!("{}: {}", args.path.display(), e);
        std::process::exit(exit_code(&e));
    }
}

fn run(args: &Params) -> Result<(), Error> {
    let options = OpenOptions {
        verify_checksums: !args.ignore_checksums,
    };
    let file = Hdf5File::open_with(&args.path, options)?;
    match &args.dataset {
        Some(path) => {
            let (values, dimensions) = file.read_data(path)?;
            println!("{}: dimensions {:?}", path, dimensions);
            println!("{:?}", values);
        }
        None => println!("{}: {:#?}", args.path.display(), file),
    }
    Ok(())
}

fn exit_code(e: &Error) -> i32 {
    match e {
        Error::NotFound(_) => 2,
        Error::Io(_) => 3,
        Error::NotAnHdf5File => 4,
        Error::ChecksumMismatch { .. } => 5,
        Error::UnsupportedVersion { .. } => 6,
        Error::UnsupportedDatatype { .. } => 7,
        Error::UnsupportedFilter { .. } => 8,
        Error::UnsupportedLink { .. } => 9,
        Error::Malformed(_) => 10,
    }
}
