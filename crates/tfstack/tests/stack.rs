//! Runs whole stacks through the public API with a fake provisioner

use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tfstack::config::Config;
use tfstack::exec::{ExecError, ExecOptions, ProcessExecutor};
use tfstack::generate::output::encode_name;
use tfstack::graph::GraphError;
use tfstack::run::{Outcome, RunError, Runner};
use tfstack::source::Getter;

#[derive(Debug, Clone)]
struct Call {
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    line: String,
}

/// Answers like a deployed stack where `network` exports `vnet_id`
#[derive(Default)]
struct FakeTerraform {
    calls: Mutex<Vec<Call>>,
}

impl FakeTerraform {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl ProcessExecutor for FakeTerraform {
    fn execute(
        &self,
        options: ExecOptions<'_>,
        command: &str,
        args: &[String],
    ) -> Result<(), ExecError> {
        let line = std::iter::once(command.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push(Call {
            working_dir: options.working_dir.map(Path::to_path_buf),
            env: options.env.clone().into_iter().collect(),
            line,
        });

        let stdout = match args.first().map(String::as_str) {
            Some("version") => vec!["Terraform v1.6.0".to_string()],
            Some("output") => vec![serde_json::json!({
                encode_name("dependency.network.outputs.vnet_id"): {
                    "sensitive": false,
                    "type": "string",
                    "value": "vnet-7"
                }
            })
            .to_string()],
            _ => vec![],
        };
        if let Some(on_stdout) = options.stdout {
            for line in &stdout {
                on_stdout(line);
            }
        }
        Ok(())
    }
}

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn runner(terraform: Arc<FakeTerraform>) -> Runner {
    Runner::new(
        Config::default(),
        terraform.clone(),
        Arc::new(Getter::new(terraform, Duration::from_secs(5))),
    )
    .with_output(Arc::new(|_, _| {}))
}

#[test]
fn plan_with_shared_settings() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "modules/network/main.tf", "# network");
    write(root, "modules/app/main.tf", "# app");
    write(
        root,
        "stacks/common_auto.hcl",
        r#"
        backend "local" {
          path = "shared.tfstate"
        }
        environment_variables {
          ARM_SUBSCRIPTION_ID = "sub-1"
        }
        "#,
    );
    write(
        root,
        "stacks/network.hcl",
        r#"module { source = "../modules/network" }"#,
    );
    write(
        root,
        "stacks/app.hcl",
        r#"
        module { source = "../modules/app" }
        dependency "network" {
          source = "./network.hcl"
        }
        inputs {
          vnet_id = dependency.network.outputs.vnet_id
          subnet  = "${dependency.network.outputs.vnet_id}/default"
        }
        "#,
    );

    let terraform = Arc::new(FakeTerraform::default());
    let report = runner(terraform.clone())
        .run(&[root.join("stacks")], "plan", &[])
        .unwrap();

    assert_eq!(
        report
            .units
            .iter()
            .map(|unit| (unit.name.as_str(), &unit.outcome))
            .collect::<Vec<_>>(),
        vec![("network", &Outcome::Completed), ("app", &Outcome::Completed)]
    );

    let working_dir = root.join("stacks/.tfstack");
    for unit in ["network", "app"] {
        assert!(working_dir.join(unit).join("main.tf").is_file());
        let backend = std::fs::read_to_string(
            working_dir.join(unit).join("tfstack_backend_override.tf"),
        )
        .unwrap();
        assert!(backend.contains("shared.tfstate"), "{backend}");
    }

    let variables =
        std::fs::read_to_string(working_dir.join("app/terraform.tfvars")).unwrap();
    let variables: hcl::Body = hcl::from_str(&variables).unwrap();
    let expected: hcl::Body = hcl::from_str(
        r#"
        vnet_id = "vnet-7"
        subnet  = "vnet-7/default"
        "#,
    )
    .unwrap();
    assert_eq!(variables, expected);

    let plans: Vec<Call> = terraform
        .calls()
        .into_iter()
        .filter(|call| call.line == "terraform plan")
        .collect();
    assert_eq!(plans.len(), 2);
    for plan in plans {
        assert!(plan
            .env
            .contains(&("ARM_SUBSCRIPTION_ID".to_string(), "sub-1".to_string())));
    }
}

#[test]
fn dependency_cycles_are_rejected_before_running() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "modules/unit/main.tf", "# unit");
    for (name, other) in [("a", "b"), ("b", "a")] {
        write(
            dir.path(),
            &format!("{name}.hcl"),
            &format!(
                r#"
                module {{ source = "./modules/unit" }}
                dependency "{other}" {{
                  source = "./{other}.hcl"
                }}
                "#
            ),
        );
    }

    let terraform = Arc::new(FakeTerraform::default());
    let err = runner(terraform.clone())
        .run(&[dir.path().to_path_buf()], "apply", &[])
        .unwrap_err();

    assert!(matches!(err, RunError::Graph(GraphError::Cycle { .. })));
    assert!(terraform.calls().is_empty());
}
