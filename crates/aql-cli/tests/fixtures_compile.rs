use std::path::PathBuf;

use aql_cli::commands::compile::{load_knowledge, load_terminology};
use aql_compiler::{AqlCompiler, CompilerConfig, Parameters};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures").join(name)
}

#[test]
fn bundled_fixtures_compile_a_query() {
    let knowledge = load_knowledge(&fixture("knowledge.json")).expect("knowledge fixture");
    let terminology = load_terminology(&fixture("terminology.json")).expect("terminology fixture");
    let compiler = AqlCompiler::new(CompilerConfig::default(), &knowledge, &terminology);

    let compiled = compiler
        .compile(
            "SELECT o/data[at0001]/origin/value AS origin FROM EHR e \
             CONTAINS COMPOSITION c CONTAINS OBSERVATION o[openEHR-EHR-OBSERVATION.blood_pressure.v1]",
            &Parameters::new(),
        )
        .expect("query compiles");
    assert_eq!(compiled.template_ids().collect::<Vec<_>>(), vec!["vital_signs.v1"]);
    assert!(compiled.sql.sql.contains("AS \"origin\""));
}

#[test]
fn missing_fixture_reports_path() {
    let err = load_knowledge(&fixture("absent.json")).unwrap_err();
    assert!(format!("{err:#}").contains("absent.json"));
}
