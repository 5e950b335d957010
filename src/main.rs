use clap::{Arg, ArgAction, Command, value_parser};
use clap_num::maybe_hex;
use exhume_body::{Body, BodySlice};
use exhume_ntfs_runs::NTFS;
use exhume_ntfs_runs::mft::fragments_to_string;
use log::{debug, error};
use serde_json::{Value, json};

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => error!("Error serializing to JSON: {}", e),
    }
}

fn main() {
    let matches = Command::new("exhume_ntfs_runs")
        .version(env!("CARGO_PKG_VERSION"))
        .author("ForensicXlab")
        .about("Exhume files, data runs and metadata from an NTFS filesystem.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The path to the body to exhume."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(value_parser!(String))
                .required(false)
                .help("The format of the file, either 'raw' or 'ewf'."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .required(true)
                .help("The NTFS partition starts at address (decimal or hex)."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(maybe_hex::<u64>)
                .required(true)
                .help("The size of the NTFS partition in sectors (decimal or hex)."),
        )
        .arg(
            Arg::new("pbs")
                .long("pbs")
                .action(ArgAction::SetTrue)
                .help("Display the partition boot sector information."),
        )
        .arg(
            Arg::new("file_id")
                .long("file")
                .value_parser(maybe_hex::<u64>)
                .help("Display the metadata about a specific file identifier."),
        )
        .arg(
            Arg::new("dir_entry")
                .short('d')
                .long("dir_entry")
                .requires("file_id")
                .action(ArgAction::SetTrue)
                .help("If --file is specified and it is a directory, list its directory entries."),
        )
        .arg(
            Arg::new("stream")
                .long("stream")
                .value_parser(value_parser!(String))
                .requires("file_id")
                .help("Use the named $DATA stream of --file instead of the unnamed one."),
        )
        .arg(
            Arg::new("runs")
                .long("runs")
                .action(ArgAction::SetTrue)
                .requires("file_id")
                .help("Display the data runs of the selected $DATA stream."),
        )
        .arg(
            Arg::new("mft")
                .long("mft")
                .action(ArgAction::SetTrue)
                .help("Display the high level master file table information."),
        )
        .arg(
            Arg::new("dump")
                .long("dump")
                .action(ArgAction::SetTrue)
                .requires("file_id")
                .help("Dump the file content to file_<ID>.bin (requires --file)"),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Output certain structures (pbs, file, mft, runs) in JSON format."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    // Initialize logger.
    let level_filter = match matches.get_one::<String>("log_level").map(String::as_str) {
        Some("error") => log::LevelFilter::Error,
        Some("warn") => log::LevelFilter::Warn,
        Some("debug") => log::LevelFilter::Debug,
        Some("trace") => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new().filter_level(level_filter).init();

    // required by clap
    let (Some(file_path), Some(offset), Some(size)) = (
        matches.get_one::<String>("body"),
        matches.get_one::<u64>("offset"),
        matches.get_one::<u64>("size"),
    ) else {
        return;
    };
    let auto = String::from("auto");
    let format = matches.get_one::<String>("format").unwrap_or(&auto);
    let show_pbs = matches.get_flag("pbs");
    let show_mft = matches.get_flag("mft");
    let show_runs = matches.get_flag("runs");
    let dump_file = matches.get_flag("dump");
    let json_output = matches.get_flag("json");
    let file_id = matches.get_one::<u64>("file_id").copied();
    let stream_name = matches
        .get_one::<String>("stream")
        .map(String::as_str)
        .unwrap_or("");
    let show_dir_entry = matches.get_flag("dir_entry");

    // 1) Prepare the "body" and open the volume.
    let mut body = Body::new(file_path.to_owned(), format);
    debug!("Created Body from '{}'", file_path);

    let partition_size = *size * body.get_sector_size() as u64;
    let mut slice = match BodySlice::new(&mut body, *offset, partition_size) {
        Ok(sl) => sl,
        Err(e) => {
            error!("Could not create BodySlice: {}", e);
            return;
        }
    };

    let mut filesystem = match NTFS::new(&mut slice) {
        Ok(fs) => fs,
        Err(e) => {
            error!("Couldn't open NTFS: {}", e);
            return;
        }
    };

    if show_pbs {
        if json_output {
            print_json(&filesystem.pbs.to_json());
        } else {
            println!("{}", filesystem.pbs);
        }
    }

    if show_mft {
        let count = filesystem.mft_records_count();
        let fragments = filesystem.mft_fragments();
        match (count, fragments) {
            (Ok(count), Ok(fragments)) => {
                if json_output {
                    print_json(&json!({ "records": count, "fragments": fragments }));
                } else {
                    println!("$MFT records: {}", count);
                    println!("{}", fragments_to_string(&fragments, Some(filesystem.pbs.cluster_size())));
                }
            }
            (Err(e), _) | (_, Err(e)) => error!("Could not read $MFT: {}", e),
        }
    }

    let Some(file_id) = file_id else {
        return;
    };
    let file = match filesystem.get_file_id(file_id) {
        Ok(file) => file,
        Err(e) => {
            error!("Could not read MFT entry {}: {}", file_id, e);
            return;
        }
    };

    if show_dir_entry {
        match filesystem.list_dir(file_id) {
            Ok(entries) => {
                if json_output {
                    let arr: Vec<Value> = entries.iter().map(|de| de.to_json()).collect();
                    print_json(&json!({ "dir_entries": arr }));
                } else {
                    for entry in entries {
                        println!("{}  {}", entry.file_id, entry.name);
                    }
                }
            }
            Err(e) => error!("Could not list directory entries for this record: {}", e),
        }
    } else if show_runs {
        match filesystem.data_fragments(&file, stream_name) {
            Ok(fragments) if json_output => print_json(&json!({ "fragments": fragments })),
            Ok(fragments) if fragments.is_empty() => println!("Stream is resident."),
            Ok(fragments) => {
                println!("{}", fragments_to_string(&fragments, Some(filesystem.pbs.cluster_size())))
            }
            Err(e) => error!("Could not decode data runs: {}", e),
        }
    } else if dump_file {
        match filesystem.read_stream(&file, stream_name) {
            Ok(data) => {
                let out_name = if stream_name.is_empty() {
                    format!("file_{:X}.bin", file_id)
                } else {
                    format!("file_{:X}_{}.bin", file_id, stream_name)
                };
                if let Err(e) = std::fs::write(&out_name, &data) {
                    error!("Cannot write dump: {}", e);
                } else {
                    println!("Dumped {} bytes to {}", data.len(), out_name);
                }
            }
            Err(e) => error!("Dump failed: {}", e),
        }
    } else if json_output {
        print_json(&file.to_json());
    } else {
        println!("{}", file);
    }
}
