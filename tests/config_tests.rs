//! Config Loading Tests
//!
//! TOML files on disk through `ModelConfig::load_from_file` and
//! `save_to_file`, and their effect on a constructed model.

use std::io::Write;

use rnnlm::config::{ConfigError, ModelConfig, OutputKind};
use rnnlm::rnn::RnnLm;

fn write_toml(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn full_file_loads_every_section() {
    let file = write_toml(
        r#"
[model]
output_layer = "flat"
bptt = 4
seed = 7

[training]
learning_rate = 0.1
l2_reg = 0.0

[generation]
max_len = 20

[grad_check]
epsilon = 0.001
tolerance = 0.0001
"#,
    );
    let config = ModelConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.model.output_layer, OutputKind::Flat);
    assert_eq!(config.model.bptt, 4);
    assert_eq!(config.model.seed, 7);
    assert_eq!(config.training.l2_reg, 0.0);
    assert_eq!(config.generation.max_len, 20);
    assert_eq!(config.grad_check.tolerance, 0.0001);

    let model = RnnLm::with_random_embeddings(6, 3, &config).unwrap();
    assert_eq!(model.output_kind(), OutputKind::Flat);
    assert_eq!(model.bptt(), 4);
    assert_eq!(model.regularization_loss(), 0.0);
}

#[test]
fn empty_file_is_defaults() {
    let file = write_toml("");
    let config = ModelConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config, ModelConfig::default());
}

#[test]
fn invalid_values_are_rejected_with_every_reason() {
    let file = write_toml(
        r#"
[training]
learning_rate = -0.5

[generation]
max_len = 0
"#,
    );
    match ModelConfig::load_from_file(file.path()) {
        Err(ConfigError::Validation(errors)) => {
            assert_eq!(errors.len(), 2);
            assert!(errors[0].contains("learning_rate"));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn unknown_output_layer_is_a_parse_error() {
    let file = write_toml("[model]\noutput_layer = \"adaptive\"\n");
    let err = ModelConfig::load_from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(..)));
    assert!(err.to_string().contains("Config parse error"));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ModelConfig::load_from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(..)));
}

#[test]
fn save_then_load_preserves_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rnnlm.toml");
    let mut config = ModelConfig::default();
    config.model.output_layer = OutputKind::Flat;
    config.model.bptt = 3;
    config.training.learning_rate = 0.05;

    config.save_to_file(&path).unwrap();
    assert_eq!(ModelConfig::load_from_file(&path).unwrap(), config);
}
