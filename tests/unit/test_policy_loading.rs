//! Unit tests for policy files and the catalog built from them

use std::io::Write;
use std::path::PathBuf;

use fwpilot::config::ConfigLoader;
use fwpilot::policy::ModelMap;
use fwpilot::{
    ArtifactLocation, ComponentIdentity, ComponentKind, Error, PolicyCatalog, PolicyRegistry,
    Version,
};
use tempfile::{NamedTempFile, TempDir};

fn fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("config")
        .join("policy.example.toml")
}

fn id(s: &str) -> ComponentIdentity {
    ComponentIdentity::from(s)
}

fn ver(s: &str) -> Version {
    Version::from(s)
}

#[test]
fn test_example_policy_loads() {
    let catalog = PolicyCatalog::load(&fixture(), None).expect("example policy loads");
    assert!(catalog.validate().is_empty(), "{:?}", catalog.validate());
    assert_eq!(catalog.images_dir(), Some("/usr/imgs"));

    for kind in ComponentKind::ALL {
        let registry = catalog.registry(kind).expect("every family has tables");
        assert!(!registry.is_empty(), "{} tables are empty", kind);
    }

    let bmc = catalog.registry(ComponentKind::Bmc).unwrap();
    assert_eq!(bmc.preferred(&id("X11DPT-B")), Some(&ver("6.39")));
    assert_eq!(
        bmc.artifact(&id("X11DPT-B"), &ver("6.39")),
        Some(&ArtifactLocation::from(
            "/usr/imgs/bmc/X11DPT-B/NX-G6-639-180122.bin"
        ))
    );

    let nic = catalog.registry(ComponentKind::Nic).unwrap();
    assert!(nic.is_acceptable(&id("15d9:0920"), &ver("0x80000a73")));
    assert!(!nic.is_acceptable(&id("15d9:0920"), &ver("0x80000a00")));
}

#[test]
fn test_example_model_map() {
    let catalog = PolicyCatalog::load(&fixture(), None).unwrap();
    let models = catalog.models();
    assert_eq!(models.len(), 2);
    assert_eq!(models.expected("NX-3060-G6", "HBA").unwrap(), &id("SAS3008"));
    assert_eq!(
        models.expected("NX-3060-G6", "MCU").unwrap(),
        &id("BPN-SAS3-217BHQ-N4-NI22")
    );
    assert!(matches!(
        models.expected("NX-1065-G6", "MCU"),
        Err(Error::Config { .. })
    ));
    assert!(matches!(
        models.expected("NX-9999", "BMC"),
        Err(Error::Config { .. })
    ));
}

#[test]
fn test_chipset_lookup() {
    let catalog = PolicyCatalog::load(&fixture(), None).unwrap();
    assert_eq!(catalog.chipset_of(&id("8086:000c")), Some("INTC"));
    assert_eq!(catalog.chipset_of(&id("15b3:0003")), Some("MLX"));
    assert_eq!(catalog.chipset_of(&id("dead:beef")), None);
}

#[test]
fn test_images_dir_override() {
    let catalog = PolicyCatalog::load(&fixture(), Some("/mnt/fw/")).unwrap();
    let hba = catalog.registry(ComponentKind::Hba).unwrap();
    assert_eq!(
        hba.artifact(&id("SAS3008"), &ver("14.00.00.00")).unwrap().as_str(),
        "/mnt/fw/hba/14.00.00.00/3008IT14.ROM"
    );
}

#[test]
fn test_json_policy() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(
        file,
        r#"{{
            "models": {{ "NX-3060-G6": {{ "BIOS": "X11DPT-B" }} }},
            "bios": [{{
                "part": "X11DPT-B",
                "preferred": "PB20.001",
                "acceptable": ["PB20.001"],
                "artifacts": {{ "PB20.001": "/usr/imgs/bios/X11DPT-B/NX11DPTB8.223" }},
                "conflicts": {{ "PB20.001": ["PB10.002"] }}
            }}]
        }}"#
    )
    .unwrap();

    let catalog = PolicyCatalog::load(file.path(), None).unwrap();
    let bios = catalog.registry(ComponentKind::Bios).unwrap();
    assert!(bios.is_conflicting(&id("X11DPT-B"), &ver("PB20.001"), &ver("PB10.002")));
    assert!(matches!(
        catalog.registry(ComponentKind::Bmc),
        Err(Error::Config { .. })
    ));
}

#[test]
fn test_missing_policy_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("absent.toml");
    match PolicyCatalog::load(&path, None) {
        Err(Error::ConfigLoadFailed { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("expected load failure, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_malformed_policy_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[[bmc]]\npart = \"X11DPT-B\"\nunknown_key = 1").unwrap();
    let err = PolicyCatalog::load(file.path(), None).unwrap_err();
    assert!(matches!(err, Error::ConfigParseFailed { .. }), "{:?}", err);
}

#[test]
fn test_validate_reports_incoherent_tables() {
    let catalog = PolicyCatalog::from_toml_str(
        r#"
[[mcu]]
part = "BPN-SAS3-827HQ-NI22"
preferred = "1.40"
conflicts = { "1.50" = ["1.08"] }

[[mcu]]
part = "BPN-SAS3-217HQ"
acceptable = ["1.08"]
"#,
    )
    .unwrap();

    let problems = catalog.validate();
    assert_eq!(problems.len(), 3, "{:?}", problems);
    assert!(problems.iter().all(|p| p.starts_with("[mcu]")));
    assert!(problems
        .iter()
        .any(|p| p.contains("preferred version 1.40 has no artifact")));
    assert!(problems.iter().any(|p| p.contains("no preferred version")));
}

#[test]
fn test_inline_policy_in_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("fwpilot.toml");
    std::fs::write(
        &path,
        r#"
[orchestrator]
images_dir = "/srv/imgs"

[[policy.hba]]
part = "SAS3008"
preferred = "14.00.00.00"
artifacts = { "14.00.00.00" = "hba/3008IT14.ROM" }
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_file(&path).unwrap();
    let catalog = config.load_catalog(None).unwrap();
    let hba = catalog.registry(ComponentKind::Hba).unwrap();
    assert_eq!(
        hba.artifact(&id("SAS3008"), &ver("14.00.00.00")).unwrap().as_str(),
        "/srv/imgs/hba/3008IT14.ROM"
    );

    // An explicit file wins over inline tables
    let catalog = config.load_catalog(Some(&fixture())).unwrap();
    assert!(catalog.registry(ComponentKind::Bmc).is_ok());
}

#[test]
fn test_single_family_catalog() {
    let registry = PolicyRegistry::builder()
        .artifact("MCX4121A-ACA_Ax", "14.20.1010", "/usr/imgs/net/mlx/fw.bin")
        .preferred("MCX4121A-ACA_Ax", "14.20.1010")
        .build();
    let mut models = ModelMap::new();
    models.insert("NX-3060-G6", "NIC0", "MCX4121A-ACA_Ax");

    let catalog = PolicyCatalog::single(ComponentKind::Mlx, registry, models);
    assert!(catalog.registry(ComponentKind::Mlx).is_ok());
    assert!(catalog.registry(ComponentKind::Nic).is_err());
    assert_eq!(
        catalog.models().expected("NX-3060-G6", "NIC0").unwrap(),
        &id("MCX4121A-ACA_Ax")
    );
}
