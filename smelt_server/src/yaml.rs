use std::path::Path;

use smelt_types::{ClientError, Command};

/// Parses smelt's YAML command-list format (§6): a top-level sequence of [`Command`] records.
pub fn load_commands(yaml: &str) -> Result<Vec<Command>, ClientError> {
    serde_yaml::from_str(yaml).map_err(|e| ClientError::MalformedInput(e.to_string()))
}

pub fn load_commands_from_path(path: &Path) -> anyhow::Result<Vec<Command>> {
    let content = std::fs::read_to_string(path)?;
    Ok(load_commands(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_a_command_list() {
        let yaml = r#"
- name: build_a
  target_type: build
  script: ["cc -o a a.c"]
  working_dir: /tmp/smelt
- name: test_a
  target_type: test
  script: ["./a"]
  dependencies: ["build_a"]
  working_dir: /tmp/smelt
"#;
        let commands = load_commands(yaml).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].dependencies, vec!["build_a".to_owned()]);
    }

    #[test]
    fn malformed_yaml_is_a_client_error() {
        let err = load_commands("not: [a, valid, command, list").unwrap_err();
        assert!(matches!(err, ClientError::MalformedInput(_)));
    }
}
