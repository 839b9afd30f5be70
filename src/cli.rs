use std::fs::read_to_string;
use std::path::PathBuf;

use structopt::StructOpt;

use crate::heap::DEFAULT_CAP;
use crate::eval::EvalOptions;

#[derive(StructOpt, Debug)]
#[structopt(name = "mlc",
            about = "an applied lambda calculus evaluated on an explicit substitution graph",
            author = "mptz",
            version = "0.1.0")]
pub struct Opt {
    #[structopt(short = "d", long = "debug")]
    pub debug : bool,

    /** Stop at binder boundaries : do not reduce under unapplied
        abstractions when printing top-level results. */
    #[structopt(short = "s", long = "surface")]
    pub surface : bool,

    /** Treat arity mismatches as stuck applications instead of
        eta-expanding partial applications on demand. */
    #[structopt(long = "strict-apply")]
    pub strict_apply : bool,

    /** Node arena cap. Reduction aborts when the live node count
        reaches this limit. */
    #[structopt(long = "heap-cap", default_value = "1000000")]
    pub heap_cap : usize,

    /** Source files to evaluate in order. With no files, read
        statements from stdin. Names are tried relative to the working
        directory first, then as given. */
    #[structopt(name = "FILE x N", parse(from_os_str))]
    files : Vec<PathBuf>,
}

impl Opt {
    pub fn try_read_files(&self) -> Result<Vec<String>, std::io::Error> {
        self.files.iter().map(|x| try_read_cwd(x)).collect()
    }

    pub fn interactive(&self) -> bool {
        self.files.is_empty()
    }

    pub fn eval_options(&self) -> EvalOptions {
        EvalOptions {
            deep : !self.surface,
            strict_apply : self.strict_apply,
            heap_cap : if self.heap_cap == 0 { DEFAULT_CAP } else { self.heap_cap },
        }
    }
}

fn try_read_cwd(suggestion : &PathBuf) -> Result<String, std::io::Error> {
    match std::env::current_dir() {
        Err(_) => read_to_string(suggestion),
        Ok(mut path) => {
            path.push(suggestion.clone());
            match read_to_string(path) {
                Ok(s) => Ok(s),
                Err(_) => read_to_string(suggestion),
            }
        }
    }
}
