//! The `mount.ffsp` tool binds an ffsp volume and hands it to the host
//! binding. The binding itself (e.g. a FUSE adapter) is an external
//! component; this front-end stops at that seam.

use std::env;
use std::process::exit;

use log::{error, info};

use ffsp::backend::FileBackend;
use ffsp::host::FfspHost;
use ffsp::mount;

fn show_usage(prog: &str) {
    println!("{} DEVICE MOUNTPOINT", prog);
    println!("mount the ffsp file system inside [DEVICE] at [MOUNTPOINT]");
    println!();
    println!("-h, --help     print this help and exit");
    println!("-V, --version  print version and exit");
    println!("-v, --verbose  enable debug logging");
}

fn show_version(prog: &str) {
    println!("{} version {}", prog, ffsp::VERSION);
}

fn main() {
    let mut iter = env::args();
    let prog = iter.next().unwrap_or_else(|| "mount.ffsp".to_owned());

    let mut verbose = false;
    let mut positional: Vec<String> = Vec::new();

    for arg in iter {
        match arg.as_str() {
            "-h" | "--help" => {
                show_usage(&prog);
                exit(0);
            }
            "-V" | "--version" => {
                show_version(&prog);
                exit(0);
            }
            "-v" | "--verbose" => verbose = true,
            _ if arg.starts_with('-') => {
                eprintln!("{}: unknown option '{}'", prog, arg);
                exit(1);
            }
            _ => positional.push(arg),
        }
    }

    ffsp::logger::init(if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });

    if positional.len() != 2 {
        show_usage(&prog);
        exit(1);
    }
    let device = &positional[0];
    let mountpoint = &positional[1];

    let backend = match FileBackend::open(device) {
        Ok(b) => b,
        Err(e) => {
            error!("opening device '{}' failed: {}", device, e);
            exit(1);
        }
    };

    let fs = match mount::mount(Box::new(backend)) {
        Ok(fs) => fs,
        Err(e) => {
            error!("mounting '{}' failed: {}", device, e);
            exit(1);
        }
    };
    info!(
        "volume '{}' ready: {} erase blocks, {} inodes",
        device,
        fs.neraseblocks(),
        fs.nino()
    );

    let host = FfspHost::new(fs);

    // The host binding is not part of this build; nothing can serve the
    // mountpoint. Unbind cleanly instead of leaving the volume open.
    error!(
        "no host binding available to serve '{}'; unmounting",
        mountpoint
    );
    if let Err(e) = host.unmount() {
        error!("unmounting '{}' failed: {}", device, e);
    }
    exit(1);
}
