//! End-to-end attempt scenarios: the apply pipeline against a local HTTP
//! server, and the attempter's recovery policy on failing checks.

use httptest::{matchers::*, responders::*, Expectation, Server};
use openssl::rsa::Rsa;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use tempfile::TempDir;
use update_engine::action::{AbortFlag, ActionCode, ActionProcessor, Pipe};
use update_engine::attempter::{run_update, UpdateAttempter};
use update_engine::bootable::BootableMarkerAction;
use update_engine::config::Config;
use update_engine::download::DownloadAction;
use update_engine::install_plan::InstallPlan;
use update_engine::payload_processor::PayloadProcessorAction;
use update_engine::payload_state::PayloadState;
use update_engine::postinstall::{PostinstallExecutor, PostinstallRunnerAction};
use update_engine::prefs::{Prefs, PrefsHandle};
use update_engine::status::{StatusObserver, StatusSnapshot, UpdateStatus};
use update_engine::system_state::{ReleaseInfo, SystemState};
use update_engine::terminator::Terminator;
use update_payload::build::PayloadBuilder;
use update_payload::{Extent, OperationTarget, OperationType, NEXT_OPERATION_KEY};

struct FeederAction<T> {
    value: Option<T>,
    output: Pipe<T>,
}

#[async_trait::async_trait(?Send)]
impl<T: 'static> update_engine::action::Action for FeederAction<T> {
    fn name(&self) -> &'static str {
        "feeder"
    }

    async fn perform(&mut self) -> ActionCode {
        match self.value.take() {
            Some(value) => {
                self.output.put(value);
                ActionCode::Success
            }
            None => ActionCode::Internal,
        }
    }
}

#[derive(Default)]
struct RecordingFlags {
    next_boot: RefCell<Vec<String>>,
}

impl bootslot::BootFlagClient for RecordingFlags {
    fn set_next_boot(&self, partition: &str) -> Result<(), bootslot::Error> {
        self.next_boot.borrow_mut().push(partition.to_string());
        Ok(())
    }

    fn mark_slot_good(&self, _partition: &str) -> Result<(), bootslot::Error> {
        Ok(())
    }
}

struct RecordingPostinstall {
    devices: Rc<RefCell<Vec<String>>>,
}

#[async_trait::async_trait(?Send)]
impl PostinstallExecutor for RecordingPostinstall {
    async fn run(&self, new_partition: &str) -> update_engine::error::Result<()> {
        self.devices.borrow_mut().push(new_partition.to_string());
        Ok(())
    }
}

struct RecordingObserver(Rc<RefCell<Vec<UpdateStatus>>>);

impl StatusObserver for RecordingObserver {
    fn on_status(&self, snapshot: &StatusSnapshot) {
        self.0.borrow_mut().push(snapshot.status);
    }
}

#[tokio::test]
async fn pipeline_applies_a_served_payload() {
    let dir = TempDir::new().unwrap();
    let prefs = PrefsHandle::new(Prefs::open(dir.path().join("prefs")).unwrap());

    let old_partition = dir.path().join("old-partition");
    let old_content: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
    fs::write(&old_partition, &old_content).unwrap();

    let rsa = Rsa::generate(2048).unwrap();
    let public_key = dir.path().join("key.pub.pem");
    fs::write(&public_key, rsa.public_key_to_pem().unwrap()).unwrap();

    let replace_data: Vec<u8> = vec![0xabu8; 1024];
    let payload = PayloadBuilder::new("1124.1.0")
        .operation(
            OperationType::Replace,
            OperationTarget::Partition,
            vec![],
            vec![Extent::new(0, 1024)],
            replace_data.clone(),
        )
        .operation(
            OperationType::SourceCopy,
            OperationTarget::Partition,
            vec![Extent::new(0, 1024)],
            vec![Extent::new(1024, 1024)],
            vec![],
        )
        .operation(
            OperationType::Replace,
            OperationTarget::Kernel,
            vec![],
            vec![Extent::new(0, 6)],
            b"kernel".to_vec(),
        )
        .pcr_policy(b"pcr archive".to_vec())
        .build(&rsa.private_key_to_pem().unwrap())
        .unwrap();
    let payload_hash = hex::encode(Sha256::digest(&payload));

    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/payload"))
            .respond_with(status_code(200).body(payload.clone())),
    );

    let plan = InstallPlan {
        is_resume: false,
        download_url: server.url_str("/payload"),
        payload_size: payload.len() as u64,
        payload_hash,
        display_version: "1124.1.0".to_string(),
        old_partition_path: old_partition.display().to_string(),
        new_partition_path: dir.path().join("new-partition").display().to_string(),
        old_kernel_path: dir.path().join("old-kernel").display().to_string(),
        new_kernel_path: dir.path().join("new-kernel").display().to_string(),
        pcr_policy_path: dir.path().join("pcrs-b.zip").display().to_string(),
    };

    let (plan_tx, plan_rx) = Pipe::pair();
    let (stream_tx, stream_rx) = Pipe::pair();
    let (outcome_tx, outcome_rx) = Pipe::pair();
    let (post_tx, post_rx) = Pipe::pair();

    let devices = Rc::new(RefCell::new(Vec::new()));
    let flags = Rc::new(RecordingFlags::default());
    let abort = AbortFlag::new();

    let mut processor = ActionProcessor::new(abort.clone());
    processor.enqueue(Box::new(FeederAction {
        value: Some(plan.clone()),
        output: plan_tx,
    }));
    processor.enqueue(Box::new(DownloadAction::new(
        prefs.clone(),
        None,
        abort.clone(),
        plan_rx,
        stream_tx,
    )));
    processor.enqueue(Box::new(PayloadProcessorAction::new(
        prefs.clone(),
        public_key,
        abort.clone(),
        stream_rx,
        outcome_tx,
    )));
    processor.enqueue(Box::new(PostinstallRunnerAction::new(
        Rc::new(RecordingPostinstall {
            devices: Rc::clone(&devices),
        }),
        abort.clone(),
        outcome_rx,
        post_tx,
    )));
    processor.enqueue(Box::new(BootableMarkerAction::new(
        Rc::clone(&flags) as _,
        abort,
        post_rx,
    )));

    let outcome = processor.start().await;
    assert_eq!(outcome.code, ActionCode::Success);
    assert_eq!(outcome.action, "bootable-marker");

    let mut expected = vec![0u8; 2048];
    expected[..1024].copy_from_slice(&replace_data);
    expected[1024..].copy_from_slice(&old_content[..1024]);
    assert_eq!(
        fs::read(PathBuf::from(&plan.new_partition_path)).unwrap(),
        expected
    );
    assert_eq!(
        fs::read(PathBuf::from(&plan.new_kernel_path)).unwrap(),
        b"kernel"
    );
    assert_eq!(
        fs::read(PathBuf::from(&plan.pcr_policy_path)).unwrap(),
        b"pcr archive"
    );
    assert_eq!(*devices.borrow(), vec![plan.new_partition_path.clone()]);
    assert_eq!(*flags.next_boot.borrow(), vec![plan.new_partition_path]);
    // Streaming progress was cleared by the verified finish.
    assert_eq!(prefs.get(NEXT_OPERATION_KEY), None);
}

fn attempter_fixture(
    server_url: String,
    prefs_dir: &TempDir,
) -> (Rc<RefCell<UpdateAttempter>>, Rc<RefCell<Vec<UpdateStatus>>>) {
    let prefs = PrefsHandle::new(Prefs::open(prefs_dir.path()).unwrap());
    let payload_state = Rc::new(RefCell::new(PayloadState::load(prefs.clone())));
    let system = SystemState {
        config: Config {
            server_url,
            ..Default::default()
        },
        prefs,
        payload_state,
        boot_device: "/dev/sda3".to_string(),
        boot_dir: PathBuf::from("/boot"),
        boot_id: "boot-1".to_string(),
        release: ReleaseInfo {
            version: "1124.0.0".to_string(),
            board: "amd64-usr".to_string(),
        },
        machine_id: "machine".to_string(),
    };
    let (terminator, _wake) = Terminator::noop();
    let mut attempter = UpdateAttempter::new(
        system,
        Rc::new(RecordingFlags::default()),
        Rc::new(RecordingPostinstall {
            devices: Rc::new(RefCell::new(Vec::new())),
        }),
        terminator,
    );
    let statuses = Rc::new(RefCell::new(Vec::new()));
    attempter.add_observer(Box::new(RecordingObserver(Rc::clone(&statuses))));
    (Rc::new(RefCell::new(attempter)), statuses)
}

#[tokio::test]
async fn no_update_attempt_returns_to_idle() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/v1/update/"))
            .respond_with(json_encoded(serde_json::json!({ "update_exists": false }))),
    );
    let prefs_dir = TempDir::new().unwrap();
    let (attempter, statuses) = attempter_fixture(server.url_str("/v1/update/"), &prefs_dir);

    let code = run_update(Rc::clone(&attempter)).await;
    assert_eq!(code, ActionCode::NoUpdate);
    assert_eq!(attempter.borrow().status(), UpdateStatus::Idle);
    assert_eq!(
        *statuses.borrow(),
        vec![UpdateStatus::CheckingForUpdate, UpdateStatus::Idle]
    );
}

#[tokio::test]
async fn unreachable_payload_counts_as_network_failure() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/v1/update/")).respond_with(
            json_encoded(serde_json::json!({
                "update_exists": true,
                "display_version": "1124.1.0",
                "payload_urls": [server.url_str("/missing-payload")],
                "size": 64,
                "hash": "beef",
            })),
        ),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/missing-payload"))
            .respond_with(status_code(404)),
    );
    let prefs_dir = TempDir::new().unwrap();
    let (attempter, statuses) = attempter_fixture(server.url_str("/v1/update/"), &prefs_dir);

    let code = run_update(Rc::clone(&attempter)).await;
    assert_eq!(code, ActionCode::Network);
    let attempter = attempter.borrow();
    assert_eq!(attempter.status(), UpdateStatus::Idle);
    assert_eq!(attempter.last_error(), Some(ActionCode::Network));
    assert_eq!(
        *statuses.borrow(),
        vec![
            UpdateStatus::CheckingForUpdate,
            UpdateStatus::UpdateAvailable,
            UpdateStatus::ReportingError,
            UpdateStatus::Idle,
        ]
    );
}
