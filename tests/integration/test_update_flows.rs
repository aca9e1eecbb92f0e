//! Integration tests for complete update runs
//!
//! Each test drives an [`UpdateJob`] against a scripted host that plays the
//! vendor tools: detection, decision, image checks, the apply steps, and
//! reboots with reconnection.

use std::path::PathBuf;
use std::sync::Arc;

use fwpilot::collector::{
    Collector, CollectorConfig, CommandCollector, NicCollector, StaticCollector,
};
use fwpilot::fleet::run_fleet;
use fwpilot::orchestrator::{ApplyOutcome, Completion, OrchestratorOptions};
use fwpilot::policy::ModelMap;
use fwpilot::runner::{JobOutcome, UpdateJob, UpdateMode};
use fwpilot::session::testing::{Reply, ScriptedHost, StaticProber};
use fwpilot::{ApplyPlan, ComponentKind, DecisionOutcome, Error, PolicyCatalog, PolicyRegistry};

const PROMPT: &str = "[root@node ~]#";

const BMC_IMAGE: &str = "/usr/imgs/bmc/X11DPT-B/NX-G6-639-180122.bin";
const BIOS_IMAGE: &str = "/usr/imgs/bios/X11DPT-B/NX11DPTB8.223";
const HBA_IMAGE: &str = "/usr/imgs/hba/14.00.00.00/3008IT14.ROM";
const NIC_IMAGE: &str = "/usr/imgs/net/intc/0x80000aee/nvmupdate.cfg";
const MCU_IMAGE: &str = "/usr/imgs/mcu/g6_g7/1.15/217N4_EC_2017-10-06_1846.45_1.15.bin";

fn catalog() -> Arc<PolicyCatalog> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("config")
        .join("policy.example.toml");
    Arc::new(PolicyCatalog::load(&path, None).expect("example policy"))
}

fn job(kind: ComponentKind, collector: impl Collector + 'static) -> UpdateJob {
    UpdateJob::new(kind, catalog(), Arc::new(collector), ApplyPlan::builtin(kind))
        .orchestrator_options(OrchestratorOptions::default())
}

fn host() -> ScriptedHost {
    ScriptedHost::new(PROMPT, "pw")
}

/// Index of the first send containing `needle`
fn position(host: &ScriptedHost, needle: &str) -> usize {
    host.sent()
        .iter()
        .position(|line| line.contains(needle))
        .unwrap_or_else(|| panic!("'{}' was never sent: {:?}", needle, host.sent()))
}

fn applied(outcome: JobOutcome) -> fwpilot::ApplyReport {
    match outcome {
        JobOutcome::Applied { report, .. } => report,
        other => panic!("expected an applied update, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_bmc_update_end_to_end() {
    let host = host()
        .on(
            "dmidecode -t baseboard",
            [Reply::prompted(
                "Base Board Information\r\n\tManufacturer: Supermicro\r\n\tProduct Name: X11DPT-B\r\n\tVersion: 1.01",
            )],
        )
        .on("-ver", [Reply::prompted("Firmware Revision : 6.20.00")])
        .on("ls /usr/imgs/bmc", [Reply::prompted(BMC_IMAGE)])
        .on(
            "UpdateBmc",
            [Reply::prompted(
                "Uploading image ... done\r\nUpdate Complete, Please wait for BMC reboot",
            )],
        )
        .on("-fdl", [Reply::prompted("Reset to the factory default completed.")]);

    let collector = CommandCollector::from_config(
        &CollectorConfig::builtin(ComponentKind::Bmc).unwrap(),
        "/usr/bin",
    )
    .unwrap();
    let outcome = job(ComponentKind::Bmc, collector)
        .run(Arc::new(host.connector(StaticProber::reachable())))
        .await
        .expect("bmc update");

    let decision = outcome.decision().clone();
    assert_eq!(decision.identity.as_str(), "X11DPT-B");
    assert_eq!(decision.current.as_str(), "6.20");
    assert_eq!(decision.target.as_str(), "6.39");

    let report = applied(outcome);
    assert_eq!(report.outcome, ApplyOutcome::Completed);
    assert_eq!(report.reboots, 0);
    assert_eq!(report.artifact.as_str(), BMC_IMAGE);
    let labels: Vec<_> = report.steps.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(
        labels,
        vec!["flash bmc", "restore bmc defaults", "cold reset bmc"]
    );
    assert!(report
        .steps
        .iter()
        .all(|s| s.completion == Completion::Completed));

    assert_eq!(
        host.count_sent(&format!(
            "/usr/bin/sumtool -c UpdateBmc --file {} --overwrite_cfg --overwrite_sdr",
            BMC_IMAGE
        )),
        1
    );
    assert!(position(&host, "ls /usr/imgs/bmc") < position(&host, "UpdateBmc"));
    assert!(position(&host, "UpdateBmc") < position(&host, "-fdl"));
    assert!(position(&host, "-fdl") < position(&host, "bmc reset cold"));
    assert_eq!(host.sent().last().map(String::as_str), Some("exit"));
    assert_eq!(host.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hba_steps_run_in_order() {
    let host = host()
        .on(
            "ls /usr/imgs/hba",
            [
                Reply::prompted(HBA_IMAGE),
                Reply::prompted("/usr/imgs/hba/14.00.00.00/mptsas3.rom"),
                Reply::prompted("/usr/imgs/hba/14.00.00.00/mpt3x64.rom"),
            ],
        )
        .on(
            "sas3flash -c 1",
            [
                Reply::prompted("Finished Processing Commands Successfully."),
                Reply::prompted("Finished Processing Commands Successfully."),
                Reply::prompted("Finished Processing Commands Successfully."),
            ],
        );

    let report = applied(
        job(ComponentKind::Hba, StaticCollector::new("SAS3008", "12.00.00.00"))
            .controller(1)
            .run(Arc::new(host.connector(StaticProber::reachable())))
            .await
            .expect("hba update"),
    );

    assert_eq!(report.steps.len(), 3);
    let firmware = position(&host, &format!("sas3flash -c 1 -f {}", HBA_IMAGE));
    let legacy = position(&host, "sas3flash -c 1 -b /usr/imgs/hba/14.00.00.00/mptsas3.rom");
    let uefi = position(&host, "sas3flash -c 1 -b /usr/imgs/hba/14.00.00.00/mpt3x64.rom");
    assert!(position(&host, "mpt3x64.rom") < firmware, "images are checked first");
    assert!(firmware < legacy && legacy < uefi);
}

#[tokio::test(start_paused = true)]
async fn test_bios_reboot_then_retry() {
    let host = host()
        .on("ls /usr/imgs/bios", [Reply::prompted(BIOS_IMAGE)])
        .on(
            "UpdateBios",
            [
                Reply::prompted(
                    "Checking BIOS image ... ok\r\nManual steps are required to complete the update.",
                ),
                Reply::prompted("WARNING: BIOS setting will be reset to factory default"),
            ],
        )
        .on("reboot -f", [Reply::hangup("Rebooting.\r\n")])
        .on(
            "LoadDefaultBiosCfg",
            [Reply::prompted("Default BIOS configuration is loaded")],
        );

    let report = applied(
        job(ComponentKind::Bios, StaticCollector::new("X11DPT-B", "PB10.002"))
            .run(Arc::new(host.connector(StaticProber::reachable())))
            .await
            .expect("bios update"),
    );

    assert_eq!(report.reboots, 1);
    assert_eq!(host.dials(), 2);
    assert_eq!(host.count_sent("reboot -f"), 1);
    assert_eq!(host.count_sent("UpdateBios"), 2);
    assert_eq!(host.count_sent("LoadDefaultBiosCfg"), 1);

    let completions: Vec<_> = report
        .steps
        .iter()
        .map(|s| (s.index, s.completion))
        .collect();
    assert_eq!(
        completions,
        vec![
            (0, Completion::RebootThenRetryRequired),
            (0, Completion::Completed),
            (1, Completion::Completed),
        ]
    );
    assert!(position(&host, "reboot -f") < position(&host, "LoadDefaultBiosCfg"));
}

#[tokio::test(start_paused = true)]
async fn test_nic_power_cycle_required() {
    let host = host()
        .on("ls /usr/imgs/net", [Reply::prompted(NIC_IMAGE)])
        .on(
            "nvmupdate64e",
            [Reply::prompted(
                "Num Description      Ver.  DevId S:B    Status\r\n\
                 01) Intel(R) X710    6.01  1572  00:001 Update successful\r\n\
                 Power Cycle required to complete the update process.",
            )],
        );

    let report = applied(
        job(ComponentKind::Nic, StaticCollector::new("15d9:0920", "0x80000900"))
            .run(Arc::new(host.connector(StaticProber::reachable())))
            .await
            .expect("nic update"),
    );

    assert_eq!(report.outcome, ApplyOutcome::PowerCycleRequired);
    assert_eq!(report.reboots, 0);
    assert_eq!(
        host.count_sent(
            "/usr/imgs/net/intc/0x80000aee/nvmupdate64e -a /usr/imgs/net/intc/0x80000aee -u -sv -l -c nvmupdate.cfg"
        ),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_nic_adapters_updated_one_by_one() {
    let host = host()
        .on(
            "ip -o link show",
            [Reply::prompted(
                "1: lo: <LOOPBACK,UP> mtu 65536\r\n\
                 2: enp24s0f0: <BROADCAST,MULTICAST,UP> mtu 1500\r\n\
                 3: enp24s0f1: <BROADCAST,MULTICAST,UP> mtu 1500\r\n\
                 4: enp94s0f0: <BROADCAST,MULTICAST,UP> mtu 1500\r\n\
                 5: enp134s0f0: <BROADCAST,MULTICAST,UP> mtu 1500",
            )],
        )
        .on(
            "ethtool -i enp24s0f0",
            [Reply::prompted(
                "driver: i40e\r\nfirmware-version: 0x80000900, 1.1747.0\r\nbus-info: 0000:18:00.0",
            )],
        )
        .on(
            "ethtool -i enp94s0f0",
            [Reply::prompted(
                "driver: mlx5_core\r\nfirmware-version: 14.20.1010 (MT_2420110034)\r\nbus-info: 0000:5e:00.0",
            )],
        )
        .on(
            "ethtool -i enp134s0f0",
            [Reply::prompted(
                "driver: ixgbe\r\nfirmware-version: 0x800007cb\r\nbus-info: 0000:86:00.0",
            )],
        )
        .on("lspci -s 0000:18:00.0", [Reply::prompted("\tSubsystem: 15d9:0920")])
        .on("lspci -s 0000:5e:00.0", [Reply::prompted("\tSubsystem: 15b3:0003")])
        .on("lspci -s 0000:86:00.0", [Reply::prompted("\tSubsystem: 8086:000c")])
        .on("ls /usr/imgs/net", [Reply::prompted(NIC_IMAGE)])
        .on(
            "nvmupdate64e",
            [Reply::prompted(
                "01) Intel(R) X710    6.01  1572  00:001 Update successful\r\n\
                 Power Cycle required to complete the update process.",
            )],
        );

    let catalog = catalog();
    let collector = NicCollector::new().within_chipset(catalog.clone(), NicCollector::CHIPSET);
    let outcomes = UpdateJob::new(
        ComponentKind::Nic,
        catalog,
        Arc::new(collector),
        ApplyPlan::builtin(ComponentKind::Nic),
    )
    .run_all(Arc::new(host.connector(StaticProber::reachable())))
    .await
    .expect("nic update");

    assert_eq!(outcomes.len(), 2, "the Mellanox port is skipped");
    assert_eq!(outcomes[0].decision().current.as_str(), "0x80000900");
    assert_eq!(outcomes[1].decision().outcome, DecisionOutcome::NoUpdateMatched);
    let report = applied(outcomes[0].clone());
    assert_eq!(report.outcome, ApplyOutcome::PowerCycleRequired);
    assert_eq!(host.count_sent("nvmupdate64e"), 1);
    assert_eq!(host.count_sent("ethtool -i enp24s0f1"), 0);
    assert_eq!(host.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reboot_flow_runs_on_spawned_task() {
    let host = host()
        .on("ls /usr/imgs/bios", [Reply::prompted(BIOS_IMAGE)])
        .on(
            "UpdateBios",
            [
                Reply::prompted("Manual steps are required to complete the update."),
                Reply::prompted("WARNING: BIOS setting will be reset to factory default"),
            ],
        )
        .on("reboot -f", [Reply::hangup("Rebooting.\r\n")])
        .on(
            "LoadDefaultBiosCfg",
            [Reply::prompted("Default BIOS configuration is loaded")],
        );

    let job = job(ComponentKind::Bios, StaticCollector::new("X11DPT-B", "PB10.002"))
        .orchestrator_options(OrchestratorOptions {
            reconnect_settle: std::time::Duration::from_secs(500),
            ..OrchestratorOptions::default()
        });
    let factory = Arc::new(host.connector(StaticProber::reachable()));
    let outcomes = tokio::spawn(async move { job.run_all(factory).await })
        .await
        .expect("job task")
        .expect("bios update");

    assert_eq!(outcomes.len(), 1);
    assert_eq!(applied(outcomes[0].clone()).reboots, 1);
    assert_eq!(host.count_sent("UpdateBios"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_mcu_progress_steps() {
    // Rules match by substring; the catch-all " " rule goes last. A bare
    // `cd` would land on a prompt that no longer matches the learned one.
    let host = host()
        .on("ls /usr/imgs/mcu", [Reply::prompted(MCU_IMAGE)])
        .on("mcuupdate", [Reply::output("Updating MCU firmware ....")])
        .on("cd /usr/bin", [Reply::output("\r\n[root@node bin]# ")])
        .on(" ", [Reply::output("....\r\n")]);

    let report = applied(
        job(
            ComponentKind::Mcu,
            StaticCollector::new("BPN-SAS3-217BHQ-N4-NI22", "1.09"),
        )
        .run(Arc::new(host.connector(StaticProber::reachable())))
        .await
        .expect("mcu update"),
    );

    let labels: Vec<_> = report.steps.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, vec!["flash mcu", "await mcu progress"]);
    assert_eq!(
        host.count_sent(&format!(
            "(cd /usr/bin && ./ipmicfg-linux.x86_64 -tp mcuupdate {})",
            MCU_IMAGE
        )),
        1
    );
    assert!(host.sent().iter().all(|line| !line.starts_with("cd ")));
}

#[tokio::test(start_paused = true)]
async fn test_up_to_date_host_is_left_alone() {
    let host = host();
    let outcome = job(ComponentKind::Bmc, StaticCollector::new("X11DPT-B", "6.39"))
        .run(Arc::new(host.connector(StaticProber::reachable())))
        .await
        .unwrap();

    match outcome {
        JobOutcome::NoUpdate(decision) => {
            assert_eq!(decision.outcome, DecisionOutcome::NoUpdateMatched)
        }
        other => panic!("expected no update, got {:?}", other),
    }
    assert_eq!(host.count_sent("ls "), 0);
    assert_eq!(host.count_sent("sumtool"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_plans_without_flashing() {
    let host = host();
    let outcome = job(ComponentKind::Hba, StaticCollector::new("SAS3008", "12.00.00.00"))
        .dry_run(true)
        .run(Arc::new(host.connector(StaticProber::reachable())))
        .await
        .unwrap();

    match outcome {
        JobOutcome::Planned(decision) => {
            assert_eq!(decision.artifact.unwrap().as_str(), HBA_IMAGE)
        }
        other => panic!("expected a plan, got {:?}", other),
    }
    assert_eq!(host.count_sent("sas3flash"), 0);
    assert_eq!(host.sent().last().map(String::as_str), Some("exit"));
}

#[tokio::test(start_paused = true)]
async fn test_conflict_blocks_before_any_flash() {
    let registry = PolicyRegistry::builder()
        .artifact("X11DPU", "6.43", "/usr/imgs/bmc/X11DPU/NX-G6-643-180206.bin")
        .preferred("X11DPU", "6.43")
        .conflict("X11DPU", "6.43", ["5.10"])
        .build();
    let catalog = Arc::new(PolicyCatalog::single(
        ComponentKind::Bmc,
        registry,
        ModelMap::new(),
    ));
    let host = host();
    let job = UpdateJob::new(
        ComponentKind::Bmc,
        catalog,
        Arc::new(StaticCollector::new("X11DPU", "5.10")),
        ApplyPlan::builtin(ComponentKind::Bmc),
    );

    let err = job
        .run(Arc::new(host.connector(StaticProber::reachable())))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConflictBlocked { .. }), "{:?}", err);
    assert_eq!(host.count_sent("ls "), 0);
    assert_eq!(host.count_sent("sumtool"), 0);
    assert_eq!(host.sent().last().map(String::as_str), Some("exit"));
}

#[tokio::test(start_paused = true)]
async fn test_forced_update_of_installed_version() {
    let host = host();
    let outcome = job(ComponentKind::Bmc, StaticCollector::new("X11DPT-B", "6.39"))
        .mode(UpdateMode::Forced {
            model: "NX-3060-G6".to_string(),
            slot: "BMC".to_string(),
            version: "6.39".into(),
        })
        .dry_run(true)
        .run(Arc::new(host.connector(StaticProber::reachable())))
        .await
        .unwrap();

    let decision = outcome.decision();
    assert!(decision.forced);
    assert!(decision.requires_update());
    assert!(matches!(outcome, JobOutcome::Planned(_)));
}

#[tokio::test(start_paused = true)]
async fn test_forced_without_image_never_connects() {
    let host = host();
    let err = job(ComponentKind::Bmc, StaticCollector::new("X11DPT-B", "6.20"))
        .mode(UpdateMode::Forced {
            model: "NX-3060-G6".to_string(),
            slot: "BMC".to_string(),
            version: "9.99".into(),
        })
        .run(Arc::new(host.connector(StaticProber::reachable())))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Config { .. }), "{:?}", err);
    assert_eq!(host.dials(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_forced_on_wrong_part_is_refused() {
    let host = host();
    let err = job(ComponentKind::Bmc, StaticCollector::new("X11DPT-B", "6.20"))
        .mode(UpdateMode::Forced {
            model: "NX-1065-G6".to_string(),
            slot: "BMC".to_string(),
            version: "6.43".into(),
        })
        .run(Arc::new(host.connector(StaticProber::reachable())))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Mismatch { .. }), "{:?}", err);
    assert_eq!(host.count_sent("sumtool"), 0);
    assert_eq!(host.sent().last().map(String::as_str), Some("exit"));
}

#[tokio::test(start_paused = true)]
async fn test_fleet_isolates_unreachable_host() {
    let job = job(ComponentKind::Bmc, StaticCollector::new("X11DPT-B", "6.39"));
    let reachable = host();
    let unreachable = host();

    let (up, down) = (reachable.clone(), unreachable.clone());
    let results = run_fleet(
        vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()],
        2,
        move |name| {
            let job = job.clone();
            let connector = if name == "10.0.0.5" {
                up.connector(StaticProber::reachable())
            } else {
                down.connector(StaticProber::unreachable())
            };
            async move { job.run(Arc::new(connector)).await }
        },
    )
    .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].host, "10.0.0.5");
    assert!(matches!(results[0].result, Ok(JobOutcome::NoUpdate(_))));
    assert!(matches!(results[1].result, Err(Error::Connection { .. })));
    assert_eq!(reachable.dials(), 1);
    assert_eq!(unreachable.dials(), 0);
}
