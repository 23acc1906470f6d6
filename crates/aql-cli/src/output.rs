use aql_compiler::{CompiledQuery, ParseNode};
use colored::Colorize;

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print the final SQL; with `verbose`, the columns and every per-template
/// statement first.
pub fn print_compiled(compiled: &CompiledQuery, schema: &str, verbose: bool) {
    if verbose {
        let columns: Vec<String> = compiled
            .columns
            .iter()
            .map(|c| {
                if c.hidden {
                    format!("{} (hidden)", c.alias)
                } else {
                    c.alias.clone()
                }
            })
            .collect();
        eprintln!("{}: {}", "Columns".cyan(), columns.join(", "));
        if let Some(sql) = compiled.containment.sql(schema) {
            eprintln!("{}: {}", "Containment".cyan(), sql);
        }
        for template in &compiled.templates {
            let id = template.template_id.as_deref().unwrap_or("(any)");
            eprintln!("{} {}", "Template".cyan(), id.bold());
            match template.builder.build() {
                Ok(built) => eprintln!("  {built}"),
                Err(e) => eprintln!("  {} {e}", "✗".red()),
            }
        }
    }
    println!("{}", compiled.sql);
}

pub fn print_tree(tree: &ParseNode) {
    print!("{}", tree.pretty());
}
