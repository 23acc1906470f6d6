#![allow(dead_code)]

use aql_compiler::{
    AqlCompiler, CompileError, CompiledQuery, CompilerConfig, InMemoryKnowledgeCache, Parameters,
    StaticTerminology,
};
use serde_json::json;

pub const BLOOD_PRESSURE: &str = "openEHR-EHR-OBSERVATION.blood_pressure.v1";
pub const LAB_TEST: &str = "openEHR-EHR-OBSERVATION.lab_test.v1";

/// Two templates: an encounter recording blood pressure, and a lab report
/// recording a lab test plus a blood pressure.
pub fn knowledge() -> InMemoryKnowledgeCache {
    InMemoryKnowledgeCache::from_json(json!([
        {
            "template_id": "vital_signs.v1",
            "root_archetype": "openEHR-EHR-COMPOSITION.encounter.v1",
            "nodes": [
                {
                    "path": "/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]",
                    "archetype_id": BLOOD_PRESSURE,
                    "class_name": "OBSERVATION",
                    "json_path": ["/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]", 0]
                },
                {
                    "path": "/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]/data[at0001]/events[at0006]",
                    "class_name": "POINT_EVENT",
                    "json_path": ["/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]", 0, "/data[at0001]", "/events[at0006]", "*"]
                },
                {
                    "path": "/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]/data[at0001]/events[at0006]/data[at0003]/items[at0004]/value",
                    "class_name": "DV_QUANTITY",
                    "json_path": ["/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]", 0, "/data[at0001]", "/events[at0006]", "*", "/data[at0003]", "/items[at0004]", 0, "/value"]
                }
            ]
        },
        {
            "template_id": "lab_report.v1",
            "root_archetype": "openEHR-EHR-COMPOSITION.report.v1",
            "nodes": [
                {
                    "path": "/content[openEHR-EHR-OBSERVATION.lab_test.v1]",
                    "archetype_id": LAB_TEST,
                    "class_name": "OBSERVATION",
                    "json_path": ["/content[openEHR-EHR-OBSERVATION.lab_test.v1]", 0]
                },
                {
                    "path": "/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]",
                    "archetype_id": BLOOD_PRESSURE,
                    "class_name": "OBSERVATION",
                    "json_path": ["/content[openEHR-EHR-OBSERVATION.blood_pressure.v1]", 0]
                }
            ]
        }
    ]))
    .expect("valid knowledge fixture")
}

pub fn terminology() -> StaticTerminology {
    StaticTerminology::from_json(json!({
        "urn:vs:severity": [
            { "code": "mild", "value": "Mild" },
            { "code": "severe", "value": "Severe" }
        ]
    }))
    .expect("valid terminology fixture")
}

pub fn compile_with(
    config: CompilerConfig,
    text: &str,
    parameters: &Parameters,
) -> Result<CompiledQuery, CompileError> {
    let knowledge = knowledge();
    let terminology = terminology();
    AqlCompiler::new(config, &knowledge, &terminology).compile(text, parameters)
}

pub fn compile(text: &str) -> Result<CompiledQuery, CompileError> {
    compile_with(CompilerConfig::default(), text, &Parameters::new())
}

pub fn sql(text: &str) -> String {
    compile(text).expect("query compiles").sql.sql
}
