//! The `mkfs.ffsp` tool creates an ffsp file system inside a file.

use std::env;
use std::process::exit;

use ffsp::mkfs::{mkfs_path, MkfsOptions};

/// Structure storing command line arguments.
struct Args {
    prog: String,
    options: MkfsOptions,
    help: bool,
    device: Option<String>,
}

fn show_usage(prog: &str) {
    println!("{} [OPTION] [DEVICE]", prog);
    println!("create an ffsp file system inside the given file [DEVICE]");
    println!();
    println!("-c, --clustersize=N use a cluster size of N bytes (default:32KiB)");
    println!("-e, --erasesize=N use an erase block size of N bytes (default:4MiB)");
    println!("-i, --open-ino=N cache N dirty inodes at a time (default:128)");
    println!("-o, --open-eb=N hold N erase blocks open at a time (default:5)");
    println!("-r, --reserve-eb=N reserve N erase blocks for internal use (default:3)");
    println!("-w, --write-eb=N garbage collect after N erase blocks were written (default:5)");
}

fn parse_u32(prog: &str, opt: &str, val: Option<String>) -> u32 {
    let val = val.unwrap_or_else(|| {
        eprintln!("{}: option '{}' requires an argument", prog, opt);
        exit(1);
    });
    val.parse().unwrap_or_else(|_| {
        eprintln!("{}: invalid value '{}' for option '{}'", prog, val, opt);
        exit(1);
    })
}

fn parse_args() -> Args {
    let mut iter = env::args();
    let prog = iter.next().unwrap_or_else(|| "mkfs.ffsp".to_owned());

    let mut args = Args {
        prog: prog.clone(),
        options: MkfsOptions::default(),
        help: false,
        device: None,
    };

    while let Some(arg) = iter.next() {
        let (opt, inline) = match arg.split_once('=') {
            Some((o, v)) => (o.to_owned(), Some(v.to_owned())),
            None => (arg.clone(), None),
        };
        let value = |iter: &mut env::Args| inline.clone().or_else(|| iter.next());

        match opt.as_str() {
            "-h" | "--help" => args.help = true,
            "-c" | "--clustersize" => {
                args.options.clustersize = parse_u32(&prog, &opt, value(&mut iter))
            }
            "-e" | "--erasesize" => {
                args.options.erasesize = parse_u32(&prog, &opt, value(&mut iter))
            }
            "-i" | "--open-ino" => {
                args.options.ninoopen = parse_u32(&prog, &opt, value(&mut iter))
            }
            "-o" | "--open-eb" => {
                args.options.neraseopen = parse_u32(&prog, &opt, value(&mut iter))
            }
            "-r" | "--reserve-eb" => {
                args.options.nerasereserve = parse_u32(&prog, &opt, value(&mut iter))
            }
            "-w" | "--write-eb" => {
                args.options.nerasewrites = parse_u32(&prog, &opt, value(&mut iter))
            }
            _ if opt.starts_with('-') => {
                eprintln!("{}: unknown option '{}'", prog, opt);
                exit(1);
            }
            _ => {
                if args.device.is_some() {
                    eprintln!("{}: more than one device given", prog);
                    exit(1);
                }
                args.device = Some(opt);
            }
        }
    }
    args
}

fn main() {
    ffsp::logger::init(log::LevelFilter::Info);

    let args = parse_args();
    if args.help {
        show_usage(&args.prog);
        exit(0);
    }
    let device = args.device.unwrap_or_else(|| {
        show_usage(&args.prog);
        exit(1);
    });

    if let Err(e) = mkfs_path(&device, &args.options) {
        eprintln!("{}: formatting '{}' failed: {}", args.prog, device, e);
        exit(1);
    }
    exit(0);
}
