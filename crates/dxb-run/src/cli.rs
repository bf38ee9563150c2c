use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use clap::Parser;
use colored::Colorize;
use dxb_lang::{BlockLayout, CompileOptions, Compiler, Config, ProtocolDataType, Receiver, Target, ValueGraph};
use itertools::Itertools;
use miette::{IntoDiagnostic, WrapErr, miette};
use rayon::prelude::*;
use std::io::{self, BufWriter, IsTerminal, Read, Write};
use std::{fs, path::PathBuf};

#[derive(Parser, Debug, Default)]
#[command(name = "dxb")]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(after_help = "# Examples:\n\n\
    ## To compile a script into a bare body:\n\
    dxb --body-only '1 + 2'\n\n\
    ## To compile script files:\n\
    dxb -f main.dx lib.dx\n\n\
    ## To compile a JSON value for @bob:\n\
    dxb --value '{\"a\": [1, 2]}' --to @bob")]
#[command(about = "dxb compiles DATEX script text and values into DATEX binary blocks.", long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    input: InputArgs,

    #[clap(flatten)]
    compile: CompileArgs,

    #[clap(flatten)]
    output: OutputArgs,

    /// Number of files to compile before switching to parallel compilation
    #[arg(short = 'P', default_value_t = 10)]
    parallel_threshold: usize,

    #[arg(value_name = "SCRIPT OR FILE")]
    script: Option<String>,
    files: Option<Vec<PathBuf>>,
}

#[derive(Clone, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Hex,
    Base64,
    Raw,
    Json,
}

#[derive(Clone, Debug, clap::Args, Default)]
struct InputArgs {
    /// Read the scripts from the given files
    #[arg(short, long, default_value_t = false)]
    from_file: bool,

    /// Compile a JSON document as a value instead of a script
    #[arg(long, value_name = "JSON", conflicts_with_all = ["script", "from_file"])]
    value: Option<String>,

    /// JSON values for the `?` placeholders of the script, in order
    #[arg(long = "arg", value_name = "JSON")]
    args: Vec<String>,
}

#[derive(Clone, Debug, clap::Args, Default)]
struct CompileArgs {
    /// Message type of the block header
    #[arg(short = 't', long = "type", value_name = "TYPE", value_parser = parse_data_type, default_value = "request")]
    data_type: ProtocolDataType,

    /// Sender endpoint, e.g. `@alice`
    #[arg(long, value_name = "ENDPOINT")]
    from: Option<String>,

    /// Receiver endpoint, repeatable
    #[arg(long, value_name = "ENDPOINT")]
    to: Vec<String>,

    /// Send the block to every endpoint
    #[arg(long, default_value_t = false, conflicts_with = "to")]
    flood: bool,

    /// Scope id to use instead of generating one
    #[arg(long)]
    sid: Option<u32>,

    /// Split blocks larger than this many bytes
    #[arg(long, value_name = "BYTES")]
    max_block_size: Option<usize>,

    #[arg(long)]
    ttl: Option<u8>,

    #[arg(long)]
    priority: Option<u8>,

    /// Print only the body, without routing and signed header (alias: --no-header)
    #[arg(long, alias = "no-header", default_value_t = false)]
    body_only: bool,

    /// Keep the scope open after the block
    #[arg(long, default_value_t = false)]
    no_end_of_scope: bool,

    /// Plugins whose `plugin NAME (...)` blocks are compiled
    #[arg(long = "plugin", value_name = "NAME")]
    plugins: Vec<String>,

    /// Plugins that must appear in the script
    #[arg(long = "require-plugin", value_name = "NAME")]
    required_plugins: Vec<String>,

    /// Encode repeated text and numbers every time they occur
    #[arg(long, default_value_t = false)]
    no_dedup: bool,
}

#[derive(Clone, Debug, clap::Args, Default)]
struct OutputArgs {
    /// Set output format
    #[arg(short = 'F', long = "format", value_enum, default_value_t)]
    format: OutputFormat,

    /// Output to the specified file
    #[clap(short = 'o', long = "output", value_name = "FILE")]
    output_file: Option<PathBuf>,
}

fn parse_data_type(s: &str) -> Result<ProtocolDataType, String> {
    s.parse()
}

/// Blocks compiled from one input.
#[derive(Debug)]
struct Compiled {
    file: Option<PathBuf>,
    blocks: Vec<Vec<u8>>,
}

impl Cli {
    pub fn run(&self) -> miette::Result<()> {
        let compiler = Compiler::new(Config::from_env());
        let options = self.compile_options()?;

        let compiled = if let Some(json) = &self.input.value {
            vec![self.compile_value(&compiler, &options, json)?]
        } else {
            self.compile_sources(&compiler, &options)?
        };

        self.print(&compiled)
    }

    fn compile_options(&self) -> miette::Result<CompileOptions> {
        let args = &self.compile;
        let parse_target =
            |s: &String| Target::parse(s).ok_or_else(|| miette!("Invalid endpoint `{}`", s));

        Ok(CompileOptions {
            data_type: args.data_type,
            sender: args.from.as_ref().map(parse_target).transpose()?,
            receivers: args
                .to
                .iter()
                .map(|to| parse_target(to).map(Receiver::from))
                .collect::<miette::Result<Vec<_>>>()?,
            flood: args.flood,
            sid: args.sid,
            end_of_scope: !args.no_end_of_scope,
            ttl: args.ttl,
            priority: args.priority,
            plugins: args.plugins.iter().map(|p| p.as_str().into()).collect(),
            required_plugins: args.required_plugins.iter().map(|p| p.as_str().into()).collect(),
            no_duplicate_value_optimization: args.no_dedup,
            max_block_size: args.max_block_size,
            add_header: !args.body_only,
            ..Default::default()
        })
    }

    fn compile_value(&self, compiler: &Compiler, options: &CompileOptions, json: &str) -> miette::Result<Compiled> {
        let json: serde_json::Value = serde_json::from_str(json)
            .into_diagnostic()
            .wrap_err("Invalid JSON value")?;
        let mut graph = ValueGraph::new();
        let id = graph.from_json(&json);
        let blocks = compiler
            .compile_value(&graph, id, options)
            .and_then(|output| output.into_blocks())
            .map_err(miette::Report::new)?;
        Ok(Compiled { file: None, blocks })
    }

    fn compile_sources(&self, compiler: &Compiler, options: &CompileOptions) -> miette::Result<Vec<Compiled>> {
        let mut graph = ValueGraph::new();
        let mut options = options.clone();
        for arg in &self.input.args {
            let json: serde_json::Value = serde_json::from_str(arg)
                .into_diagnostic()
                .wrap_err_with(|| format!("Invalid JSON argument `{}`", arg))?;
            options.inserted_values.push(graph.from_json(&json));
        }

        let sources = self.read_sources()?;
        let compile = |(file, code): &(Option<PathBuf>, String)| -> miette::Result<Compiled> {
            tracing::debug!(file = ?file, "compiling");
            let blocks = compiler
                .compile(code, &options, &graph)
                .and_then(|output| output.into_blocks())
                .map_err(miette::Report::new);
            let blocks = match file {
                Some(file) => blocks.wrap_err_with(|| format!("Failed to compile {}", file.display()))?,
                None => blocks?,
            };
            Ok(Compiled {
                file: file.clone(),
                blocks,
            })
        };

        if sources.len() > self.parallel_threshold {
            sources.par_iter().map(compile).collect()
        } else {
            sources.iter().map(compile).collect()
        }
    }

    fn read_sources(&self) -> miette::Result<Vec<(Option<PathBuf>, String)>> {
        if self.input.from_file {
            let files = self
                .script
                .iter()
                .map(PathBuf::from)
                .chain(self.files.iter().flatten().cloned())
                .collect::<Vec<_>>();
            if files.is_empty() {
                return Err(miette!("No input files"));
            }
            return files
                .into_iter()
                .map(|file| {
                    let content = fs::read_to_string(&file)
                        .into_diagnostic()
                        .wrap_err_with(|| format!("File not found: {}", file.display()))?;
                    Ok((Some(file), content))
                })
                .collect();
        }

        match &self.script {
            Some(script) => Ok(vec![(None, script.clone())]),
            None if io::stdin().is_terminal() => Err(miette!("No script given")),
            None => {
                let mut input = String::new();
                io::stdin().read_to_string(&mut input).into_diagnostic()?;
                Ok(vec![(None, input)])
            }
        }
    }

    fn print(&self, compiled: &[Compiled]) -> miette::Result<()> {
        let to_terminal = self.output.output_file.is_none() && io::stdout().is_terminal();
        colored::control::set_override(to_terminal);

        let stdout = io::stdout();
        let mut handle: Box<dyn Write> = if let Some(output_file) = &self.output.output_file {
            let file = fs::File::create(output_file).into_diagnostic()?;
            Box::new(BufWriter::new(file))
        } else {
            Box::new(BufWriter::new(stdout.lock()))
        };

        match self.output.format {
            OutputFormat::Hex => {
                for block in compiled.iter().flat_map(|c| &c.blocks) {
                    writeln!(handle, "{}", self.hex_line(block)).into_diagnostic()?;
                }
            }
            OutputFormat::Base64 => {
                for block in compiled.iter().flat_map(|c| &c.blocks) {
                    writeln!(handle, "{}", STANDARD.encode(block)).into_diagnostic()?;
                }
            }
            OutputFormat::Raw => {
                for block in compiled.iter().flat_map(|c| &c.blocks) {
                    handle.write_all(block).into_diagnostic()?;
                }
            }
            OutputFormat::Json => {
                let json = compiled.iter().map(|c| self.to_json(c)).collect::<Vec<_>>();
                let json = serde_json::to_string_pretty(&json).into_diagnostic()?;
                writeln!(handle, "{}", json).into_diagnostic()?;
            }
        }

        handle.flush().into_diagnostic()?;
        Ok(())
    }

    /// Hex digits of a block, with the routing prefix and signed header dimmed.
    fn hex_line(&self, block: &[u8]) -> String {
        let hex = |bytes: &[u8]| bytes.iter().map(|b| format!("{:02x}", b)).join("");
        match self.layout(block) {
            Some(layout) => format!(
                "{}{}{}",
                hex(&block[..layout.body_start]).dimmed(),
                hex(layout.body(block)),
                hex(&block[layout.body_end..]).dimmed()
            ),
            None => hex(block),
        }
    }

    fn layout(&self, block: &[u8]) -> Option<BlockLayout> {
        if self.compile.body_only {
            None
        } else {
            BlockLayout::parse(block)
        }
    }

    fn to_json(&self, compiled: &Compiled) -> serde_json::Value {
        let blocks = compiled
            .blocks
            .iter()
            .map(|block| {
                serde_json::json!({
                    "size": block.len(),
                    "base64": STANDARD.encode(block),
                    "layout": self.layout(block),
                })
            })
            .collect::<Vec<_>>();
        serde_json::json!({
            "file": compiled.file.as_ref().map(|f| f.display().to_string()),
            "blocks": blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use scopeguard::defer;
    use std::io::Write;
    use std::{fs::File, path::PathBuf};

    use super::*;

    fn create_file(name: &str, content: &str) -> PathBuf {
        let temp_file_path = std::env::temp_dir().join(name);
        let mut file = File::create(&temp_file_path).expect("Failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("Failed to write to temp file");
        temp_file_path
    }

    fn body_only() -> CompileArgs {
        CompileArgs {
            body_only: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_cli_compile_script() {
        let cli = Cli {
            compile: body_only(),
            script: Some("1 + 2".to_string()),
            ..Cli::default()
        };
        let compiled = cli
            .compile_sources(&Compiler::default(), &cli.compile_options().unwrap())
            .unwrap();
        assert_eq!(compiled.len(), 1);
        assert_eq!(compiled[0].blocks, vec![vec![0xc1, 0x01, 0x92, 0xc1, 0x02, 0x01]]);
    }

    #[test]
    fn test_cli_compile_files_in_parallel() {
        let files = (0..4)
            .map(|i| create_file(&format!("dxb_cli_parallel_{}.dx", i), &format!("{}", i)))
            .collect::<Vec<_>>();
        let cleanup = files.clone();
        defer! {
            for file in &cleanup {
                let _ = std::fs::remove_file(file);
            }
        }

        let cli = Cli {
            input: InputArgs {
                from_file: true,
                ..Default::default()
            },
            compile: body_only(),
            parallel_threshold: 1,
            files: Some(files.clone()),
            ..Cli::default()
        };
        let compiled = cli
            .compile_sources(&Compiler::default(), &cli.compile_options().unwrap())
            .unwrap();

        assert_eq!(compiled.iter().map(|c| c.file.clone().unwrap()).collect::<Vec<_>>(), files);
        for (i, c) in compiled.iter().enumerate() {
            assert_eq!(c.blocks, vec![vec![0xc1, i as u8, 0x01]]);
        }
    }

    #[test]
    fn test_cli_placeholders_from_args() {
        let cli = Cli {
            input: InputArgs {
                args: vec!["7".to_string(), "\"x\"".to_string()],
                ..Default::default()
            },
            compile: body_only(),
            script: Some("[?, ?]".to_string()),
            ..Cli::default()
        };
        let compiled = cli
            .compile_sources(&Compiler::default(), &cli.compile_options().unwrap())
            .unwrap();
        assert_eq!(
            compiled[0].blocks,
            vec![vec![0xe0, 0xea, 0xc1, 0x07, 0xea, 0xce, 0x01, b'x', 0xe1, 0x01]]
        );
    }

    #[test]
    fn test_cli_invalid_endpoint() {
        let cli = Cli {
            compile: CompileArgs {
                to: vec!["bob".to_string()],
                ..Default::default()
            },
            ..Cli::default()
        };
        assert!(cli.compile_options().is_err());
    }

    #[test]
    fn test_cli_missing_file() {
        let cli = Cli {
            input: InputArgs {
                from_file: true,
                ..Default::default()
            },
            script: Some("/nonexistent/dxb_cli_missing.dx".to_string()),
            ..Cli::default()
        };
        assert!(cli.run().is_err());
    }

    #[test]
    fn test_cli_json_output_has_layout() {
        let cli = Cli {
            script: Some("1".to_string()),
            ..Cli::default()
        };
        let options = cli.compile_options().unwrap();
        let compiled = cli.compile_sources(&Compiler::default(), &options).unwrap();
        let json = cli.to_json(&compiled[0]);
        let layout = &json["blocks"][0]["layout"];
        assert_eq!(layout["size"].as_u64(), Some(compiled[0].blocks[0].len() as u64));
    }
}
