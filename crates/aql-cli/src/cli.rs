use std::path::PathBuf;

use aql_compiler::StartRule;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "aqlc")]
#[command(about = "Compile openEHR AQL queries to SQL")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to ./aqlc.toml when present)
    #[arg(short, long, global = true, env = "AQLC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug logging and per-template output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile a query and print the generated SQL
    Compile(CompileArgs),
    /// Parse text and print the parse tree
    Parse(ParseArgs),
}

#[derive(clap::Args)]
pub struct CompileArgs {
    /// AQL query text
    pub query: String,
    /// Knowledge fixture: a JSON array of template definitions
    #[arg(long)]
    pub knowledge: Option<PathBuf>,
    /// Terminology fixture: a JSON object of value set url to concepts
    #[arg(long)]
    pub terminology: Option<PathBuf>,
    /// Query parameter as name=value (repeatable)
    #[arg(short, long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<String>,
    /// Render document comparisons with the jsquery operator
    #[arg(long)]
    pub jsquery: bool,
}

#[derive(clap::Args)]
pub struct ParseArgs {
    /// Text to parse
    pub text: String,
    /// Start rule
    #[arg(long, default_value = "query")]
    pub rule: RuleArg,
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum RuleArg {
    #[default]
    Query,
    Select,
    Where,
    Path,
    Contains,
}

impl From<RuleArg> for StartRule {
    fn from(rule: RuleArg) -> Self {
        match rule {
            RuleArg::Query => StartRule::Query,
            RuleArg::Select => StartRule::SelectItem,
            RuleArg::Where => StartRule::WhereExpr,
            RuleArg::Path => StartRule::IdentifiedPath,
            RuleArg::Contains => StartRule::ContainsExpr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_args() {
        let cli = Cli::try_parse_from([
            "aqlc",
            "compile",
            "SELECT c FROM EHR e CONTAINS COMPOSITION c",
            "--param",
            "ehr=1",
            "-p",
            "n=2",
            "--jsquery",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Compile(args) => {
                assert_eq!(args.params, vec!["ehr=1", "n=2"]);
                assert!(args.jsquery);
                assert!(args.knowledge.is_none());
            }
            Commands::Parse(_) => panic!("expected compile"),
        }
    }

    #[test]
    fn test_parse_rule() {
        let cli = Cli::try_parse_from(["aqlc", "parse", "c/name/value", "--rule", "path"]).unwrap();
        match cli.command {
            Commands::Parse(args) => {
                assert_eq!(StartRule::from(args.rule), StartRule::IdentifiedPath)
            }
            Commands::Compile(_) => panic!("expected parse"),
        }
        assert!(Cli::try_parse_from(["aqlc", "parse", "x", "--rule", "order"]).is_err());
    }
}
