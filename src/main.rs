//! lotcache CLI - Sweep and inspect a frame cache directory.

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use lotcache::{
    cache::{CacheFileName, Evictor, FrameIndex, StoreStats, sweep},
    schema::CacheConfig,
};

fn main() {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("--example") => print_example_config(),
        Some("sweep") if args.len() > 2 => run_sweep(&PathBuf::from(&args[2])),
        Some("watch") if args.len() > 2 => run_watch(&PathBuf::from(&args[2])),
        Some("inspect") if args.len() > 2 => run_inspect(&PathBuf::from(&args[2])),
        _ => {
            eprintln!("Usage: {} <command> [path]", args[0]);
            eprintln!();
            eprintln!("Maintain a Lottie frame cache directory.");
            eprintln!();
            eprintln!("Commands:");
            eprintln!("  sweep <config.json>  Remove expired and orphaned cache files");
            eprintln!("  watch <config.json>  Sweep every sweep_interval_secs until killed");
            eprintln!("  inspect <map file>   Print the contents of a frame index");
            eprintln!("  --example            Print an example configuration");
            std::process::exit(1);
        }
    }
}

fn load_config(path: &Path) -> CacheConfig {
    let config_str = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Error reading config file: {}", e);
        std::process::exit(1);
    });

    let config: CacheConfig = serde_json::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        std::process::exit(1);
    });

    if let Err(e) = config.validate() {
        eprintln!("Invalid config: {}", e);
        std::process::exit(1);
    }
    config
}

fn run_sweep(config_path: &Path) {
    let config = load_config(config_path);

    println!("Sweeping {}", config.cache_dir.display());
    let start = Instant::now();

    match sweep(&config.cache_dir, config.version, SystemTime::now()) {
        Ok(report) => println!(
            "  {} ({:.1} ms)",
            report,
            start.elapsed().as_secs_f64() * 1000.0
        ),
        Err(e) => {
            eprintln!("Error sweeping cache: {}", e);
            std::process::exit(1);
        }
    }
}

fn run_watch(config_path: &Path) {
    let config = load_config(config_path);

    println!(
        "Watching {} (every {} s)",
        config.cache_dir.display(),
        config.sweep_interval_secs
    );
    let _evictor = Evictor::from_config(&config).unwrap_or_else(|e| {
        eprintln!("Error starting evictor: {}", e);
        std::process::exit(1);
    });

    loop {
        std::thread::park();
    }
}

fn run_inspect(map_path: &Path) {
    if !map_path.exists() {
        eprintln!("No such file: {}", map_path.display());
        std::process::exit(1);
    }

    let name = map_path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(CacheFileName::parse);
    let index = FrameIndex::load(map_path);

    println!("Frame index {}", map_path.display());
    println!("==============");
    match &name {
        Some(name) => {
            println!("Key: {}", name.cache_key);
            println!("Version: {}", name.version);
            println!("Codec: {}", name.codec.as_str());
            println!("Buffer size: {} bytes", name.buffer_size);
            println!("Live time: {} s", name.live_time_secs);
        }
        None => println!("(file name is not a cache file name)"),
    }
    println!(
        "Frames {}..={} at {} fps",
        index.start_frame, index.end_frame, index.fps
    );

    let stats = StoreStats {
        frame_count: index.entries.len(),
        stored_bytes: index.stored_bytes(),
        finished: index.finished,
    };
    println!("{}", stats);

    if let Some(name) = name
        && stats.frame_count > 0
    {
        let raw = name.buffer_size as u64 * stats.frame_count as u64;
        println!(
            "Compression ratio: {:.2}x",
            raw as f64 / stats.stored_bytes.max(1) as f64
        );
    }
}

fn print_example_config() {
    let config = CacheConfig::default();

    println!("Example configuration (config.json):");
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_default()
    );
}
