use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use aql_compiler::{
    AqlCompiler, DisabledTerminology, InMemoryKnowledgeCache, ParameterValue, Parameters,
    StaticTerminology, TerminologyService,
};
use tracing::debug;

use crate::cli::CompileArgs;
use crate::config::AppConfig;
use crate::output::print_compiled;

pub fn run(cfg: &AppConfig, args: &CompileArgs, verbose: bool) -> Result<()> {
    let mut compiler_config = cfg.compiler.clone();
    if args.jsquery {
        compiler_config.use_jsquery = true;
    }
    let schema = compiler_config.schema.clone();

    let knowledge = match args.knowledge.as_deref().or(cfg.fixtures.knowledge.as_deref()) {
        Some(path) => load_knowledge(path)?,
        None => InMemoryKnowledgeCache::new(),
    };
    let terminology: Box<dyn TerminologyService> =
        match args.terminology.as_deref().or(cfg.fixtures.terminology.as_deref()) {
            Some(path) => Box::new(load_terminology(path)?),
            None => Box::new(DisabledTerminology),
        };
    let parameters = parse_params(&args.params)?;

    let compiler = AqlCompiler::new(compiler_config, &knowledge, terminology.as_ref());
    let compiled = compiler.compile(&args.query, &parameters)?;
    debug!(templates = compiled.templates.len(), "compiled");
    print_compiled(&compiled, &schema, verbose);
    Ok(())
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))
}

pub fn load_knowledge(path: &Path) -> Result<InMemoryKnowledgeCache> {
    InMemoryKnowledgeCache::from_json(read_json(path)?)
        .with_context(|| format!("invalid knowledge fixture {}", path.display()))
}

pub fn load_terminology(path: &Path) -> Result<StaticTerminology> {
    StaticTerminology::from_json(read_json(path)?)
        .with_context(|| format!("invalid terminology fixture {}", path.display()))
}

/// Parse `name=value` pairs. Values that read as JSON scalars keep their
/// type; anything else is text.
pub fn parse_params(raw: &[String]) -> Result<Parameters> {
    let mut parameters = Parameters::new();
    for pair in raw {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("parameter '{pair}' must be NAME=VALUE"))?;
        let name = name.trim().trim_start_matches('$');
        if name.is_empty() {
            return Err(anyhow!("parameter '{pair}' has no name"));
        }
        let json = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        let value = ParameterValue::try_from(json)
            .or_else(|_| ParameterValue::try_from(serde_json::Value::String(value.to_string())))?;
        parameters.insert(name, value);
    }
    Ok(parameters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        let params = parse_params(&[
            "n=5".to_string(),
            "$name=Smith".to_string(),
            "flag=true".to_string(),
            "list=[1,2]".to_string(),
        ])
        .unwrap();
        assert_eq!(params.get("n"), Some(&ParameterValue::Integer(5)));
        assert_eq!(params.get("name"), Some(&ParameterValue::Text("Smith".into())));
        assert_eq!(params.get("flag"), Some(&ParameterValue::Boolean(true)));
        assert_eq!(params.get("list"), Some(&ParameterValue::Text("[1,2]".into())));
    }

    #[test]
    fn test_parse_params_rejects_missing_separator() {
        assert!(parse_params(&["novalue".to_string()]).is_err());
        assert!(parse_params(&["=1".to_string()]).is_err());
    }
}
