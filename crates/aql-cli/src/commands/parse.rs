use anyhow::Result;
use aql_compiler::{StartRule, parse_fragment};

use crate::cli::ParseArgs;
use crate::output::print_tree;

pub fn run(args: &ParseArgs) -> Result<()> {
    let tree = parse_fragment(StartRule::from(args.rule), &args.text)?;
    print_tree(&tree);
    Ok(())
}
