//! Board flags in the `-<name> <value>` form used by the BSP scripts.

use std::path::PathBuf;

use crate::UsageError;

pub const DEFAULT_BOOTARGS: &str =
    "console=ttyAMA0 earlycon cma=8M coherent_pool=2M root=vda0 rootfstype=elm rootwait rw";

/// Fully resolved board configuration. Every field has a default, so an
/// empty flag list is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub gic: u32,
    pub dumpdtb: Option<PathBuf>,
    pub el: u32,
    pub smp: u32,
    /// Guest RAM in MiB.
    pub mem: u32,
    pub debug: bool,
    pub bootargs: String,
    pub initrd: Option<PathBuf>,
    pub graphic: bool,
    pub block: String,
    pub tap: bool,
    pub ssh: u16,
    pub scsi: String,
    pub flash: String,
    pub emmc: String,
    pub nvme: String,
    pub plugged_mem: Option<String>,
    pub iommu: String,
    pub sound: String,
    pub gl: bool,
    pub virtfs: Option<PathBuf>,
    pub ufs: String,
    pub dtb: Option<PathBuf>,
    pub dtbo: Vec<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            gic: 2,
            dumpdtb: None,
            el: 1,
            smp: 4,
            mem: 128,
            debug: false,
            bootargs: DEFAULT_BOOTARGS.to_string(),
            initrd: None,
            graphic: false,
            block: "block".to_string(),
            tap: false,
            ssh: 12055,
            scsi: "scsi".to_string(),
            flash: "flash".to_string(),
            emmc: "emmc".to_string(),
            nvme: "nvme".to_string(),
            plugged_mem: None,
            iommu: "smmu".to_string(),
            sound: "hda".to_string(),
            gl: false,
            virtfs: None,
            ufs: "ufs".to_string(),
            dtb: None,
            dtbo: Vec::new(),
        }
    }
}

impl Options {
    /// Parses board flags in one left-to-right pass. Unknown tokens are
    /// skipped and a repeated flag overrides the earlier one, except
    /// `-dtbo` which accumulates.
    pub fn parse<I, S>(tokens: I) -> Result<Self, UsageError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut opts = Self::default();
        let mut tokens = tokens.into_iter().map(Into::into);

        while let Some(token) = tokens.next() {
            let Some(name) = token.strip_prefix('-') else {
                continue;
            };
            match name {
                "debug" => opts.debug = true,
                "graphic" => opts.graphic = true,
                "tap" => opts.tap = true,
                "gl" => opts.gl = true,
                "gic" | "dumpdtb" | "el" | "smp" | "mem" | "bootargs" | "initrd" | "block"
                | "ssh" | "flash" | "emmc" | "nvme" | "plugged-mem" | "iommu" | "sound" | "9p"
                | "ufs" | "dtb" | "dtbo" => {
                    let value = tokens
                        .next()
                        .ok_or_else(|| UsageError::MissingValue(name.to_string()))?;
                    opts.set(name, value)?;
                }
                _ => {}
            }
        }
        Ok(opts)
    }

    fn set(&mut self, name: &str, value: String) -> Result<(), UsageError> {
        match name {
            "gic" => self.gic = integer(name, &value)?,
            "dumpdtb" => self.dumpdtb = Some(value.into()),
            "el" => self.el = integer(name, &value)?,
            "smp" => self.smp = integer(name, &value)?,
            "mem" => self.mem = integer(name, &value)?,
            "bootargs" => self.bootargs = value,
            "initrd" => self.initrd = Some(value.into()),
            "block" => self.block = value,
            "ssh" => self.ssh = integer(name, &value)?,
            "flash" => self.flash = value,
            "emmc" => self.emmc = value,
            "nvme" => self.nvme = value,
            "plugged-mem" => self.plugged_mem = Some(value),
            "iommu" => self.iommu = value,
            "sound" => self.sound = value,
            "9p" => self.virtfs = Some(value.into()),
            "ufs" => self.ufs = value,
            "dtb" => self.dtb = Some(value.into()),
            "dtbo" => self.dtbo.push(value.into()),
            _ => unreachable!("unhandled value flag -{name}"),
        }
        Ok(())
    }
}

fn integer<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, UsageError> {
    value.trim().parse().map_err(|_| UsageError::InvalidInteger {
        flag: flag.to_string(),
        value: value.to_string(),
    })
}
