use std::env;
use std::path::Path;
use std::process;

use ristretto::jvm::{read_class_file, ClassParser};
use ristretto::program::Program;
use ristretto::runtime::Runtime;

fn main() {
    pretty_env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        let name = args.first().map_or("ristretto", String::as_str);
        eprintln!("USAGE: {name} <class file>");
        process::exit(1);
    }
    let path = &args[1];

    let class_file_bytes = read_class_file(Path::new(path)).unwrap_or_else(|err| {
        eprintln!("{path}: {err}");
        process::exit(1);
    });
    let class_file = ClassParser::parse(&class_file_bytes).unwrap_or_else(|err| {
        eprintln!("{path}: {err}");
        process::exit(1);
    });
    let program = Program::new(class_file).unwrap_or_else(|err| {
        eprintln!("{path}: {err}");
        process::exit(1);
    });

    // The runtime owns the heap; everything is released when the program
    // and runtime drop at the end of main.
    let mut runtime = Runtime::new(&program);
    if let Err(err) = runtime.run() {
        eprintln!("{path}: {err}");
        process::exit(1);
    }
}
