use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "shotgun-aggregate", version = "0.1.1")]
pub struct Arguments {

    #[arg(short, long, help = "Module to run: aggregate | functional")]
    pub module: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'i', long = "input", help = "Directory holding per-sample output files named <sample><suffix>")]
    pub input_dir: Option<String>,

    #[arg(short = 'o', long = "out", help = "Output directory for the store and flat exports. If not specified, a directory named '<prefix>_YYYYMMDD' will be created in the current working directory.")]
    pub out_dir: Option<String>,

    #[arg(long, default_value = "results.h5", help = "Store filename; relative paths resolve against the output directory")]
    pub store: String,

    #[arg(long = "prefix", default_value = "run", help = "Run prefix used for flat export filenames")]
    pub prefix: String,

    #[arg(short = 'r', long = "ref-store", help = "Read-only reference store with group-mapping tables")]
    pub ref_store: Option<String>,

    #[arg(long = "read-counts", help = "Delimited table of raw per-sample read counts (columns: name,n_reads)")]
    pub read_counts: Option<String>,

    #[arg(long, help = "Delimited manifest describing the run's samples; written verbatim into the store")]
    pub manifest: Option<String>,

    #[arg(long = "quant-suffix", default_value = ".json")]
    pub quant_suffix: String,

    #[arg(long = "taxo-suffix", default_value = ".metaphlan")]
    pub taxo_suffix: String,
}
