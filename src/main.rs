#![forbid(unsafe_code)]
#![allow(unused_parens)]

use std::io::{ self, BufRead, Write };
use std::time::SystemTime;

use structopt::StructOpt;

use crate::cli::Opt;
use crate::eval::Evaluator;
use crate::errors::MlcErr;

pub mod errors;
pub mod symbol;
pub mod term;
pub mod parser;
pub mod prim;
pub mod env;
pub mod node;
pub mod heap;
pub mod flatten;
pub mod subst;
pub mod reduce;
pub mod readback;
pub mod resolve;
pub mod eval;
pub mod cli;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL : mimallocator::Mimalloc = mimallocator::Mimalloc;

fn main() {
    env_logger::init();
    let opt = Opt::from_args();

    if opt.debug {
        println!("CLI returned these arguments : {:#?}", opt);
    }

    let sources = match opt.try_read_files() {
        Ok(strings) => strings,
        Err(e) => errors::source_file_err(line!(), e),
    };

    let start_instant = SystemTime::now();
    let mut evaluator = Evaluator::new(opt.eval_options());

    if opt.interactive() {
        repl(&mut evaluator);
    } else {
        for source in sources {
            run_source(&mut evaluator, &source);
        }
    }

    if opt.debug {
        if let Err(e) = evaluator.audit() {
            eprintln!("reference count audit failed : {}", e);
        }
    }

    match start_instant.elapsed() {
        Ok(dur) => println!("\n### done. {} statements evaluated in {:?}; \
                             {} nodes in use, {} allocated over the session. ###\n",
                            evaluator.num_statements, dur,
                            evaluator.heap.in_use(), evaluator.heap.total_allocated()),
        Err(e) => println!("\n### done. {} statements evaluated, but measuring the elapsed \
                             time failed : {} ###\n",
                           evaluator.num_statements, e),
    }
}

fn run_source(evaluator : &mut Evaluator, source : &str) {
    match evaluator.eval_source(source) {
        Ok(results) => {
            for result in results {
                for diagnostic in result.diagnostics.iter() {
                    eprintln!("! {}", diagnostic);
                }
                println!("{}", evaluator.render(&result.term));
            }
        },
        Err(e) => eprintln!("{}", e),
    }
}

/// Statement-at-a-time loop over stdin. Input accumulates until it
/// parses as a complete sequence of statements; an unterminated
/// statement just waits for more lines.
fn repl(evaluator : &mut Evaluator) {
    let stdin = io::stdin();
    let mut buffer = String::new();
    print_prompt("> ");
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        buffer.push_str(&line);
        buffer.push('\n');
        match evaluator.eval_source(&buffer) {
            Err(MlcErr::ParseEof) => {
                print_prompt(". ");
                continue
            },
            Err(e) => eprintln!("{}", e),
            Ok(results) => {
                for result in results {
                    for diagnostic in result.diagnostics.iter() {
                        eprintln!("! {}", diagnostic);
                    }
                    println!("{}", evaluator.render(&result.term));
                }
            },
        }
        buffer.clear();
        print_prompt("> ");
    }
}

fn print_prompt(prompt : &str) {
    print!("{}", prompt);
    let _ = io::stdout().flush();
}
