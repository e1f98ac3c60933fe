use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::time::UNIX_EPOCH;

use nightscript::{cache, compile, TableHost, VM};

/// Run a NightScript source file, keeping a `.nsc` bytecode cache next to
/// it: a fresh cache skips compilation entirely, a stale or missing one is
/// rewritten after compiling.
fn main() {
    let mut args = env::args().skip(1);
    let path = match args.next() {
        Some(path) => path,
        None => {
            eprintln!("usage: nightscript <script.ns>");
            process::exit(64);
        }
    };

    let source = match fs::read_to_string(&path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read {}: {}", path, err);
            process::exit(66);
        }
    };
    let mtime = fs::metadata(&path)
        .ok()
        .and_then(|meta| meta.modified().ok())
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|age| age.as_secs())
        .unwrap_or(0);

    let mut vm = VM::new();
    let cache_path = format!("{}.nsc", path);
    let chunk = match cache::load(Path::new(&cache_path), &mut vm.heap_mut().strings, mtime) {
        Ok(chunk) => chunk,
        Err(_) => {
            let Some(chunk) = compile(&source, &mut vm.heap_mut().strings) else {
                process::exit(65);
            };
            let _ = cache::save(Path::new(&cache_path), &chunk, &vm.heap().strings, mtime);
            chunk
        }
    };

    let mut host = TableHost::new();
    if vm.execute(&chunk, &mut host).is_err() {
        process::exit(70);
    }
}
