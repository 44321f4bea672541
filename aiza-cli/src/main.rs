use aiza_core::bpe::{DEFAULT_EOS, TrainerConfig, train};
use aiza_core::tokenizer::Vocabulary;
use aiza_infer::{BigramRunner, GenerateParams, InferenceConfig, InferenceEngine};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

type CmdResult = std::result::Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "aiza")]
#[command(about = "BPE tokenizer and streaming text generation runtime")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a BPE tokenizer on text files (one document per line)
    Train {
        /// Corpus files
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,

        /// Where to write the tokenizer artifact
        #[arg(short, long, default_value = "tokenizer.json")]
        output: PathBuf,

        /// Target vocabulary size, reserved bytes and specials included
        #[arg(long, default_value = "10000")]
        vocab_size: u32,

        /// Extra special tokens, kept whole during encoding
        #[arg(long = "special")]
        specials: Vec<String>,

        /// Do not register the end-of-sequence token
        #[arg(long)]
        no_eos: bool,
    },

    /// Encode text to token ids
    Encode {
        #[arg(short, long, default_value = "tokenizer.json")]
        tokenizer: PathBuf,

        /// Text to encode
        text: String,
    },

    /// Decode token ids to text
    Decode {
        #[arg(short, long, default_value = "tokenizer.json")]
        tokenizer: PathBuf,

        /// Token ids
        #[arg(required = true, num_args = 1..)]
        ids: Vec<u32>,
    },

    /// Show a summary of a tokenizer artifact
    Inspect {
        #[arg(short, long, default_value = "tokenizer.json")]
        tokenizer: PathBuf,

        /// Number of leading merges to list
        #[arg(long, default_value = "20")]
        merges: usize,
    },

    /// Generate text with a bigram model fitted on a corpus
    Generate {
        #[arg(short, long, default_value = "tokenizer.json")]
        tokenizer: PathBuf,

        /// Corpus files used to fit the bigram model
        #[arg(short, long, required = true, num_args = 1..)]
        corpus: Vec<PathBuf>,

        /// Prompt text
        #[arg(short, long)]
        prompt: String,

        /// JSON generation config; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Maximum tokens to generate
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Sampling temperature (0 = greedy)
        #[arg(long)]
        temperature: Option<f32>,

        /// Top-k filter (0 disables)
        #[arg(long)]
        top_k: Option<usize>,

        /// RNG seed for reproducible output
        #[arg(long)]
        seed: Option<u64>,

        /// Context window of the model
        #[arg(long)]
        max_seq_len: Option<usize>,

        /// Print fragments as they are produced
        #[arg(long)]
        stream: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct GenerateConfig {
    generate: GenerateParams,
    inference: InferenceConfig,
    max_seq_len: usize,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            generate: GenerateParams::default(),
            inference: InferenceConfig::default(),
            max_seq_len: 1024,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Train {
            input,
            output,
            vocab_size,
            specials,
            no_eos,
        } => cmd_train(&input, &output, vocab_size, specials, no_eos),
        Commands::Encode { tokenizer, text } => cmd_encode(&tokenizer, &text),
        Commands::Decode { tokenizer, ids } => cmd_decode(&tokenizer, &ids),
        Commands::Inspect { tokenizer, merges } => cmd_inspect(&tokenizer, merges),
        Commands::Generate {
            tokenizer,
            corpus,
            prompt,
            config,
            max_tokens,
            temperature,
            top_k,
            seed,
            max_seq_len,
            stream,
        } => {
            let overrides = Overrides {
                max_tokens,
                temperature,
                top_k,
                seed,
                max_seq_len,
            };
            cmd_generate(&tokenizer, &corpus, &prompt, config.as_deref(), overrides, stream)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn read_documents(paths: &[PathBuf]) -> std::result::Result<Vec<String>, std::io::Error> {
    let mut docs = Vec::new();
    for path in paths {
        let text = std::fs::read_to_string(path)?;
        docs.extend(
            text.lines()
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string),
        );
    }
    Ok(docs)
}

fn cmd_train(
    input: &[PathBuf],
    output: &Path,
    vocab_size: u32,
    specials: Vec<String>,
    no_eos: bool,
) -> CmdResult {
    let docs = read_documents(input)?;
    eprintln!("corpus: {} documents from {} files", docs.len(), input.len());

    let mut special_tokens = Vec::new();
    if !no_eos {
        special_tokens.push(DEFAULT_EOS.to_string());
    }
    special_tokens.extend(specials);
    let config = TrainerConfig {
        vocab_size,
        special_tokens,
        eos_token: (!no_eos).then(|| DEFAULT_EOS.to_string()),
        ..Default::default()
    };

    let start = Instant::now();
    let vocab = train(&docs, &config)?;
    eprintln!(
        "trained: {} tokens, {} merges in {:.1}ms",
        vocab.len(),
        vocab.merge_count(),
        start.elapsed().as_secs_f64() * 1000.0
    );

    vocab.save(output)?;
    println!("saved tokenizer to {}", output.display());

    let sample = "What is a budget?";
    let ids = vocab.encode(sample);
    println!("  sample:  {sample}");
    println!("  encoded: {ids:?}");
    println!("  decoded: {}", vocab.decode(&ids));
    Ok(())
}

fn cmd_encode(tokenizer: &Path, text: &str) -> CmdResult {
    let vocab = Vocabulary::load(tokenizer)?;
    let ids = vocab.encode(text);
    let rendered: Vec<String> = ids.iter().map(u32::to_string).collect();
    println!("{}", rendered.join(" "));
    Ok(())
}

fn cmd_decode(tokenizer: &Path, ids: &[u32]) -> CmdResult {
    let vocab = Vocabulary::load(tokenizer)?;
    println!("{}", vocab.decode(ids));
    Ok(())
}

fn cmd_inspect(tokenizer: &Path, show: usize) -> CmdResult {
    let vocab = Vocabulary::load(tokenizer)?;
    println!("tokenizer: {}", tokenizer.display());
    println!("  vocab:    {}", vocab.len());
    println!("  merges:   {}", vocab.merge_count());
    println!("  unk id:   {}", vocab.unk_id());
    match vocab.eos_id() {
        Some(id) => println!("  eos id:   {id}"),
        None => println!("  eos id:   none"),
    }
    if !vocab.special_tokens().is_empty() {
        println!("  specials: {}", vocab.special_tokens().join(", "));
    }
    if show > 0 && vocab.merge_count() > 0 {
        println!();
        println!("  merges:");
        for (left, right, rank) in vocab.merges().take(show) {
            println!("    {rank:>6}  {left:?} + {right:?}");
        }
    }
    Ok(())
}

struct Overrides {
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_k: Option<usize>,
    seed: Option<u64>,
    max_seq_len: Option<usize>,
}

fn load_generate_config(path: Option<&Path>, o: Overrides) -> std::result::Result<GenerateConfig, Box<dyn std::error::Error>> {
    let mut cfg = match path {
        Some(p) => serde_json::from_str(&std::fs::read_to_string(p)?)?,
        None => GenerateConfig::default(),
    };
    if let Some(v) = o.max_tokens {
        cfg.generate.max_tokens = v;
    }
    if let Some(v) = o.temperature {
        cfg.generate.sampling.temperature = v;
    }
    if let Some(v) = o.top_k {
        cfg.generate.sampling.top_k = Some(v);
    }
    if let Some(v) = o.seed {
        cfg.generate.sampling.seed = Some(v);
    }
    if let Some(v) = o.max_seq_len {
        cfg.max_seq_len = v;
    }
    Ok(cfg)
}

fn cmd_generate(
    tokenizer: &Path,
    corpus: &[PathBuf],
    prompt: &str,
    config: Option<&Path>,
    overrides: Overrides,
    stream: bool,
) -> CmdResult {
    let cfg = load_generate_config(config, overrides)?;
    tracing::debug!(?cfg, "generation config");
    let vocab = Vocabulary::load(tokenizer)?;

    // every document ends with EOS so the model learns where to stop
    let fit_start = Instant::now();
    let docs = read_documents(corpus)?;
    let seqs: Vec<Vec<u32>> = docs
        .iter()
        .map(|d| {
            let mut ids = vocab.encode(d);
            ids.extend(vocab.eos_id());
            ids
        })
        .collect();
    let model = BigramRunner::fit(seqs.iter().map(Vec::as_slice), vocab.len(), cfg.max_seq_len)?;
    eprintln!(
        "model: bigram over {} documents, fitted in {:.1}ms",
        docs.len(),
        fit_start.elapsed().as_secs_f64() * 1000.0
    );

    let mut engine = InferenceEngine::new(model, vocab, cfg.inference.clone());
    let start = Instant::now();

    if stream {
        let mut out = std::io::stdout().lock();
        write!(out, "{prompt}")?;
        out.flush()?;
        let mut fragments = engine.generate_streaming(prompt, &cfg.generate)?;
        for fragment in fragments.by_ref() {
            write!(out, "{}", fragment?)?;
            out.flush()?;
        }
        writeln!(out)?;
        let elapsed = start.elapsed().as_secs_f64();
        let n = fragments.generated();
        eprintln!(
            "\n{} tokens in {:.1}ms ({:.1} tok/s), finish: {}",
            n,
            elapsed * 1000.0,
            n as f64 / elapsed.max(1e-9),
            fragments.finish_reason().map_or("length", |r| r.as_str()),
        );
    } else {
        let completion = engine.complete(prompt, &cfg.generate)?;
        println!("{}", completion.text);
        let elapsed = start.elapsed().as_secs_f64();
        eprintln!(
            "\nprompt: {} tokens, generated: {} tokens in {:.1}ms, finish: {}, truncations: {}",
            completion.prompt_tokens,
            completion.completion_tokens,
            elapsed * 1000.0,
            completion.finish_reason.as_str(),
            completion.truncations,
        );
    }
    Ok(())
}
