//! Tests for project and driver management.

use std::cell::Cell;
use std::ffi::OsString;
use std::fs;
use std::sync::Arc;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::process::{CommandError, CommandOutput};
use crate::provider::ProviderClient;
use crate::test_support::{ScriptedProvider, ScriptedRunner};

/// Runner standing in for `ssh-keygen`: writes a key pair at the `-f` path.
#[derive(Debug, Default)]
struct KeygenStub {
    calls: Cell<usize>,
}

impl CommandRunner for KeygenStub {
    fn run(&self, _program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.calls.set(self.calls.get() + 1);
        let path = args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default();
        fs::write(&path, "PRIVATE").unwrap_or_else(|err| panic!("write private key: {err}"));
        fs::write(format!("{path}.pub"), "ssh-rsa GENERATED nimus\n")
            .unwrap_or_else(|err| panic!("write public key: {err}"));
        Ok(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

struct CatalogFixture {
    _tmp: TempDir,
    home: Utf8PathBuf,
}

impl CatalogFixture {
    fn catalog<R: CommandRunner>(&self, runner: R) -> Catalog<R> {
        let projects =
            ProjectStore::load(&self.home).unwrap_or_else(|err| panic!("projects: {err}"));
        let drivers = DriverStore::load(&self.home).unwrap_or_else(|err| panic!("drivers: {err}"));
        let mut registry = ProviderRegistry::new();
        registry.register("fake", |driver: &Driver| {
            let token = driver
                .credentials
                .get("token")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            if token.is_empty() {
                return Err(ProviderError::Auth("token missing".to_owned()));
            }
            Ok(Arc::new(ScriptedProvider::new()) as Arc<dyn ProviderClient>)
        });
        Catalog::new(
            projects,
            drivers,
            registry,
            KeyGenerator::new(runner, "ssh-keygen"),
        )
    }

    fn write_credentials(&self, contents: &str) -> Utf8PathBuf {
        let path = self.home.join("credentials.json");
        fs::create_dir_all(&self.home).unwrap_or_else(|err| panic!("home: {err}"));
        fs::write(&path, contents).unwrap_or_else(|err| panic!("credentials: {err}"));
        path
    }
}

#[fixture]
fn fixture() -> CatalogFixture {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let home = Utf8PathBuf::from_path_buf(tmp.path().join("home"))
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    CatalogFixture { _tmp: tmp, home }
}

#[rstest]
fn project_create_generates_keys_and_persists(fixture: CatalogFixture) {
    let mut catalog = fixture.catalog(KeygenStub::default());

    let summary = catalog
        .project_create("demo")
        .unwrap_or_else(|err| panic!("create project: {err}"));

    assert_eq!(summary.instances, 0);
    assert!(fixture.home.join("projects/demo.json").is_file());
    let reloaded =
        ProjectStore::load(&fixture.home).unwrap_or_else(|err| panic!("reload: {err}"));
    let project = reloaded
        .get("demo")
        .unwrap_or_else(|| panic!("project should persist"));
    assert_eq!(project.public_key, "ssh-rsa GENERATED nimus");
}

#[rstest]
fn project_create_passes_keygen_arguments(fixture: CatalogFixture) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    let mut catalog = fixture.catalog(runner.clone());

    let err = catalog
        .project_create("demo")
        .expect_err("scripted runner writes no key files");

    assert!(matches!(err, CatalogError::KeyGen(KeyGenError::Read { .. })), "unexpected: {err}");
    let invocations = runner.invocations();
    let command = invocations
        .first()
        .map(|call| call.command_string())
        .unwrap_or_else(|| panic!("ssh-keygen should run"));
    let key_path = fixture.home.join("ssh/demo");
    assert_eq!(
        command,
        format!("ssh-keygen -t rsa -C nimus -N  -q -f {key_path}")
    );
    assert!(catalog.project_list().is_empty());
}

#[rstest]
fn project_create_reuses_existing_keys(fixture: CatalogFixture) {
    let ssh = fixture.home.join("ssh");
    fs::create_dir_all(&ssh).unwrap_or_else(|err| panic!("ssh dir: {err}"));
    fs::write(ssh.join("demo"), "PRIVATE").unwrap_or_else(|err| panic!("key: {err}"));
    fs::write(ssh.join("demo.pub"), "ssh-rsa EXISTING nimus\n")
        .unwrap_or_else(|err| panic!("key: {err}"));
    let runner = KeygenStub::default();
    let mut catalog = fixture.catalog(runner);

    catalog
        .project_create("demo")
        .unwrap_or_else(|err| panic!("create project: {err}"));

    assert_eq!(catalog.keys.runner.calls.get(), 0);
    let public_key = catalog.projects.get("demo").map(|project| project.public_key.clone());
    assert_eq!(public_key.as_deref(), Some("ssh-rsa EXISTING nimus"));
}

#[rstest]
fn project_create_reports_keygen_failure(fixture: CatalogFixture) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(1), "", "permission denied\n");
    let mut catalog = fixture.catalog(runner);

    let err = catalog
        .project_create("demo")
        .expect_err("keygen failure should surface");

    assert!(
        matches!(
            err,
            CatalogError::KeyGen(KeyGenError::Failed { code: Some(1), ref stderr }) if stderr == "permission denied"
        ),
        "unexpected error: {err}"
    );
}

#[rstest]
fn duplicate_projects_are_rejected_before_keygen(fixture: CatalogFixture) {
    let mut catalog = fixture.catalog(KeygenStub::default());
    catalog
        .project_create("demo")
        .unwrap_or_else(|err| panic!("create project: {err}"));

    let err = catalog
        .project_create("demo")
        .expect_err("duplicate should fail");

    assert!(matches!(err, CatalogError::AlreadyExists { kind: "project", .. }), "unexpected: {err}");
    assert_eq!(catalog.keys.runner.calls.get(), 1);
}

#[rstest]
fn project_remove_keeps_keys(fixture: CatalogFixture) {
    let mut catalog = fixture.catalog(KeygenStub::default());
    catalog
        .project_create("demo")
        .unwrap_or_else(|err| panic!("create project: {err}"));

    catalog
        .project_remove("demo")
        .unwrap_or_else(|err| panic!("remove project: {err}"));

    assert!(catalog.project_list().is_empty());
    assert!(fixture.home.join("ssh/demo").is_file());
    let err = catalog
        .project_remove("demo")
        .expect_err("second removal should fail");
    assert!(matches!(err, CatalogError::NotFound { kind: "project", .. }), "unexpected: {err}");
}

#[rstest]
fn driver_create_validates_and_persists(fixture: CatalogFixture) {
    let path = fixture.write_credentials(r#"{ "token": "secret" }"#);
    let mut catalog = fixture.catalog(KeygenStub::default());

    let summary = catalog
        .driver_create("fake", "main", &path)
        .unwrap_or_else(|err| panic!("create driver: {err}"));

    assert_eq!(
        summary,
        DriverSummary {
            name: "main".to_owned(),
            provider: "fake".to_owned()
        }
    );
    assert_eq!(catalog.driver_list(), vec![summary]);
    assert!(fixture.home.join("drivers/main.json").is_file());
}

#[rstest]
#[case::rejected_credentials(r#"{ "token": "" }"#, "fake")]
#[case::unknown_provider(r#"{ "token": "secret" }"#, "aws")]
fn driver_create_rejects_invalid_drivers(
    fixture: CatalogFixture,
    #[case] credentials: &str,
    #[case] provider: &str,
) {
    let path = fixture.write_credentials(credentials);
    let mut catalog = fixture.catalog(KeygenStub::default());

    let err = catalog
        .driver_create(provider, "main", &path)
        .expect_err("driver should be rejected");

    assert!(matches!(err, CatalogError::InvalidDriver { .. }), "unexpected: {err}");
    assert!(!fixture.home.join("drivers/main.json").exists());
}

#[rstest]
fn driver_create_reports_unreadable_credentials(fixture: CatalogFixture) {
    let mut catalog = fixture.catalog(KeygenStub::default());
    let missing = fixture.home.join("missing.json");

    let err = catalog
        .driver_create("fake", "main", &missing)
        .expect_err("missing file should fail");
    assert!(matches!(err, CatalogError::Credentials { .. }), "unexpected: {err}");

    let garbled = fixture.write_credentials("not json");
    let parse_err = catalog
        .driver_create("fake", "main", &garbled)
        .expect_err("garbled file should fail");
    assert!(matches!(parse_err, CatalogError::Credentials { .. }), "unexpected: {parse_err}");
}

#[rstest]
fn driver_remove_deletes_record(fixture: CatalogFixture) {
    let path = fixture.write_credentials(r#"{ "token": "secret" }"#);
    let mut catalog = fixture.catalog(KeygenStub::default());
    catalog
        .driver_create("fake", "main", &path)
        .unwrap_or_else(|err| panic!("create driver: {err}"));

    catalog
        .driver_remove("main")
        .unwrap_or_else(|err| panic!("remove driver: {err}"));

    assert!(catalog.driver_list().is_empty());
    let err = catalog
        .driver_remove("main")
        .expect_err("second removal should fail");
    assert!(matches!(err, CatalogError::NotFound { kind: "driver", .. }), "unexpected: {err}");
}
