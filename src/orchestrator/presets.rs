//! Built-in apply plans for the supported families

use super::plan::{ApplyPlan, ApplyStep};
use crate::policy::ComponentKind;
use crate::transaction::PatternSpec;

fn exact(text: &str) -> [PatternSpec; 1] {
    [PatternSpec::exact(text)]
}

/// Plan used when configuration does not supply one for `kind`
pub fn builtin(kind: ComponentKind) -> ApplyPlan {
    match kind {
        ComponentKind::Bmc => bmc(),
        ComponentKind::Bios => bios(),
        ComponentKind::Hba => hba(),
        ComponentKind::Mcu => mcu(),
        ComponentKind::Mlx => mlx(),
        ComponentKind::Nic => nic(),
    }
}

fn bmc() -> ApplyPlan {
    ApplyPlan::new(vec![
        ApplyStep::new(
            "flash bmc",
            "{tools_dir}/sumtool -c UpdateBmc --file {file} --overwrite_cfg --overwrite_sdr",
        )
        .until(exact("Update Complete"))
        .timeout_secs(2000)
        .sync_prompt(200),
        ApplyStep::new("restore bmc defaults", "{tools_dir}/ipmicfg-linux.x86_64 -fdl")
            .until(exact("completed"))
            .timeout_secs(10),
        ApplyStep::new("cold reset bmc", "{tools_dir}/ipmitool bmc reset cold")
            .timeout_secs(10)
            .settle(120),
    ])
}

fn bios() -> ApplyPlan {
    ApplyPlan::new(vec![
        ApplyStep::new("flash bios", "{tools_dir}/sumtool -c UpdateBios --file {file}")
            .until(exact("WARNING"))
            .timeout_secs(800)
            .reboot_on("Manual steps are required")
            .sync_prompt(30),
        ApplyStep::new("load default bios config", "{tools_dir}/sumtool -c LoadDefaultBiosCfg")
            .until(exact("configuration is loaded"))
            .timeout_secs(30)
            .sync_prompt(30),
    ])
}

fn hba() -> ApplyPlan {
    ApplyPlan::new(vec![
        ApplyStep::new("flash hba firmware", "{tools_dir}/sas3flash -c {controller} -f {file}")
            .until(exact("Successfully"))
            .timeout_secs(60)
            .sync_prompt(30),
        ApplyStep::new("flash legacy boot rom", "{tools_dir}/sas3flash -c {controller} -b {file}")
            .artifact("{artifact_dir}/mptsas3.rom")
            .until(exact("Successfully"))
            .timeout_secs(40)
            .sync_prompt(30),
        ApplyStep::new("flash uefi boot rom", "{tools_dir}/sas3flash -c {controller} -b {file}")
            .artifact("{artifact_dir}/mpt3x64.rom")
            .until(exact("Successfully"))
            .timeout_secs(30)
            .sync_prompt(30),
    ])
}

fn mcu() -> ApplyPlan {
    ApplyPlan::new(vec![
        // Subshell: the tool runs from its own directory, the login shell
        // (and its prompt) stays where it was
        ApplyStep::new(
            "flash mcu",
            "(cd {tools_dir} && ./ipmicfg-linux.x86_64 -tp mcuupdate {file})",
        )
        .until(exact("...."))
        .timeout_secs(100),
        ApplyStep::new("await mcu progress", " ")
            .until(exact("...."))
            .timeout_secs(20),
    ])
}

fn mlx() -> ApplyPlan {
    ApplyPlan::new(vec![ApplyStep::new("flash mlx", "{tools_dir}/mlxup -i {file} -f -u")
        .timeout_secs(200)
        .require("(?i)Done")
        .fail_on("(?i)flash write failed")
        .sync_prompt(200)])
}

fn nic() -> ApplyPlan {
    ApplyPlan::new(vec![ApplyStep::new(
        "flash nic nvm",
        "{artifact_dir}/nvmupdate64e -a {artifact_dir} -u -sv -l -c {artifact_name}",
    )
    .timeout_secs(200)
    .power_cycle_on("Power (.*) required")])
}
