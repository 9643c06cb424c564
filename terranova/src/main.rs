mod logging;
mod state_cmd;

use anyhow::Result;
use clap::{CommandFactory as _, Parser, Subcommand};
use std::{io::IsTerminal as _, path::PathBuf, process::exit};

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn run_args(args: Args) -> Result<()> {
    logging::set_up(logging::Options {
        verbose: args.options.verbose,
        color: std::io::stderr().is_terminal(),
    })?;
    match &args.command {
        Commands::State(sub) => {
            let out = state_cmd::run(&args.options.state_file, sub)?;
            print!("{}", out);
            Ok(())
        }
        Commands::GenerateMan => (|| {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        })(),
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "terranova", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn handle_result(r: Result<()>) {
    match r {
        Ok(()) => {}
        Err(e) => {
            eprintln!("terranova error: {:#}", e);
            exit(1);
        }
    }
}

/// Terranova: inspect and reconcile deployment state
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Parser, Debug, Clone)]
struct Options {
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    /// The state file of the deployment
    #[arg(long, global = true, default_value = "terranova.state.json")]
    state_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect or repair the resource state
    #[command(subcommand)]
    State(state_cmd::Args),

    /// Generate markdown documentation for terranova
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for terranova
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for terranova
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_forget() {
        let args = Args::parse_from([
            "terranova",
            "--state-file",
            "deploy/state.json",
            "state",
            "forget",
            "jobs",
            "nightly-etl",
        ]);
        assert_eq!(args.options.state_file, PathBuf::from("deploy/state.json"));
        match args.command {
            Commands::State(state_cmd::Args::Forget { section, name }) => {
                assert_eq!(section, "jobs");
                assert_eq!(name, "nightly-etl");
            }
            c => panic!("unexpected command: {:?}", c),
        }
    }

    #[test]
    fn test_default_state_file() {
        let args = Args::parse_from(["terranova", "state", "list"]);
        assert_eq!(
            args.options.state_file,
            PathBuf::from("terranova.state.json")
        );
    }
}
