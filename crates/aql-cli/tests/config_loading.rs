use std::{env, fs};

use aql_cli::config::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("aqlc.toml");

    let toml_content = r#"
[compiler]
use_jsquery = true
server_node_id = "node.example.org"
max_templates = 8

[logging]
level = "debug"

[fixtures]
knowledge = "fixtures/knowledge.json"
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses, unspecified fields keep their defaults
    let cfg = load_config(Some(&path)).expect("should parse config");
    assert!(cfg.compiler.use_jsquery);
    assert_eq!(cfg.compiler.server_node_id, "node.example.org");
    assert_eq!(cfg.compiler.schema, "ehr");
    assert_eq!(cfg.compiler.max_templates, 8);
    assert_eq!(cfg.logging.level, "debug");
    assert!(cfg.fixtures.knowledge.is_some());
    assert!(cfg.fixtures.terminology.is_none());

    // 2) Env override should win over file
    unsafe {
        env::set_var("AQLC__COMPILER__MAX_TEMPLATES", "3");
    }
    let cfg_env = load_config(Some(&path)).expect("should parse config with env overrides");
    assert_eq!(cfg_env.compiler.max_templates, 3);
    unsafe {
        env::remove_var("AQLC__COMPILER__MAX_TEMPLATES");
    }

    // 3) Invalid values fail validation
    let bad_path = dir.path().join("bad.toml");
    fs::write(&bad_path, "[compiler]\nschema = \"\"\n").expect("write bad toml");
    let err = load_config(Some(&bad_path)).expect_err("empty schema must fail");
    assert!(format!("{err:#}").contains("schema"));

    let bad_level = dir.path().join("level.toml");
    fs::write(&bad_level, "[logging]\nlevel = \"loud\"\n").expect("write bad toml");
    assert!(load_config(Some(&bad_level)).is_err());

    // 4) A named file must exist
    assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
}
