//! Turns resolved [`Options`] into a `qemu-system-aarch64` argument list.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use crate::host::Host;
use crate::options::Options;
use crate::version::{QemuVersion, UFS_MIN, VIRTIO_SOUND_MIN};
use crate::UsageError;

pub const DEFAULT_QEMU: &str = "qemu-system-aarch64";
pub const DEFAULT_KERNEL: &str = "rtthread.bin";

/// Tag the guest mounts the 9p share under.
const VIRTFS_TAG: &str = "hostshare";

/// GICv2 cannot route more than eight CPUs.
const GICV2_MAX_CPUS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gic {
    Version(u32),
    Max,
}

impl fmt::Display for Gic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gic::Version(v) => write!(f, "{v}"),
            Gic::Max => f.write_str("max"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionLevel {
    El1,
    El2,
    El3,
}

impl ExceptionLevel {
    fn machine_flags(self) -> &'static str {
        match self {
            ExceptionLevel::El1 => "",
            ExceptionLevel::El2 => ",virtualization=on",
            ExceptionLevel::El3 => ",secure=on",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iommu {
    Smmu,
    Virtio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sound {
    Hda,
    Virtio,
}

/// Enumerated choices validated from [`Options`]. Resolving this needs no
/// external process, so bad flags fail before anything is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub gic: Gic,
    pub el: ExceptionLevel,
    pub iommu: Iommu,
    pub sound: Sound,
}

impl Selection {
    pub fn resolve(opts: &Options) -> Result<Self, UsageError> {
        let el = match opts.el {
            1 => ExceptionLevel::El1,
            2 => ExceptionLevel::El2,
            3 => ExceptionLevel::El3,
            other => return Err(UsageError::InvalidExceptionLevel(other)),
        };

        let mut gic = Gic::Version(opts.gic);
        if opts.smp > GICV2_MAX_CPUS {
            gic = Gic::Max;
        }
        if el == ExceptionLevel::El2 && gic == Gic::Version(3) {
            gic = Gic::Max;
        }

        let iommu = match opts.iommu.as_str() {
            "smmu" => Iommu::Smmu,
            "virtio" => Iommu::Virtio,
            other => return Err(UsageError::InvalidIommu(other.to_string())),
        };

        if opts.gl && !opts.graphic {
            return Err(UsageError::GlWithoutGraphic);
        }

        let sound = match opts.sound.as_str() {
            "hda" => Sound::Hda,
            "virtio" => Sound::Virtio,
            other => return Err(UsageError::InvalidSound(other.to_string())),
        };

        Ok(Self {
            gic,
            el,
            iommu,
            sound,
        })
    }
}

/// What the invocation depends on outside the board flags.
#[derive(Debug, Clone)]
pub struct Environment {
    pub qemu: PathBuf,
    pub kernel: PathBuf,
    pub version: QemuVersion,
    pub host: Host,
}

impl Environment {
    pub fn new(version: QemuVersion, host: Host) -> Self {
        Self {
            qemu: PathBuf::from(DEFAULT_QEMU),
            kernel: PathBuf::from(DEFAULT_KERNEL),
            version,
            host,
        }
    }

    pub fn with_qemu(mut self, qemu: impl Into<PathBuf>) -> Self {
        self.qemu = qemu.into();
        self
    }

    pub fn with_kernel(mut self, kernel: impl Into<PathBuf>) -> Self {
        self.kernel = kernel.into();
        self
    }
}

/// A qcow2-backed drive the board attaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskImage {
    pub role: &'static str,
    pub name: String,
}

impl DiskImage {
    fn new(role: &'static str, name: &str) -> Self {
        Self {
            role,
            name: name.to_string(),
        }
    }

    pub fn file_name(&self) -> PathBuf {
        PathBuf::from(format!("{}.qcow2", self.name))
    }
}

/// A complete emulator command line plus the images it expects on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub disks: Vec<DiskImage>,
}

impl Invocation {
    pub fn assemble(
        opts: &Options,
        sel: &Selection,
        env: &Environment,
    ) -> Result<Self, UsageError> {
        let windows = env.host.windows;
        let ufs = env.version >= UFS_MIN;

        if sel.sound == Sound::Virtio && env.version < VIRTIO_SOUND_MIN {
            return Err(UsageError::VirtioSoundUnsupported {
                found: env.version,
                min: VIRTIO_SOUND_MIN,
            });
        }

        let mut bootargs = opts.bootargs.clone();
        if opts.graphic && windows {
            bootargs.push_str(" ramfb.buffer_size=1");
        }
        if opts.virtfs.is_some() {
            bootargs.push_str(&format!(" 9p.tag={VIRTFS_TAG} 9p.mount=host"));
        }

        let mut net = if opts.tap {
            String::from("tap,ifname=tap0")
        } else {
            String::from("user")
        };
        if opts.tap {
            if !windows {
                net.push_str(",script=no,downscript=no");
            }
            tracing::warn!("SSH forwarding is not set up in TAP mode");
        } else {
            net.push_str(&format!(",hostfwd=tcp::{}-:22", opts.ssh));
        }

        let smmu = if sel.iommu == Iommu::Smmu { "iommu=smmuv3," } else { "" };
        let dumpdtb = opts
            .dumpdtb
            .as_ref()
            .map(|p| format!(",dumpdtb={}", option_value(&p.display().to_string())))
            .unwrap_or_default();

        let mut a = Args::default();
        a.pair(
            "-M",
            format!(
                "virt,acpi=on,{smmu}its=on,gic-version={}{dumpdtb}{}",
                sel.gic,
                sel.el.machine_flags()
            ),
        );
        a.pair("-cpu", "max");
        a.pair("-smp", opts.smp.to_string());
        a.pair("-m", opts.mem.to_string());
        a.pair("-kernel", env.kernel.display().to_string());
        a.pair("-append", bootargs);
        if let Some(dtb) = &opts.dtb {
            a.pair("-dtb", dtb.display().to_string());
        }
        if let Some(initrd) = &opts.initrd {
            a.pair("-initrd", initrd.display().to_string());
        }
        a.pair("-device", "vmcoreinfo");

        if opts.graphic {
            a.pair("-serial", "stdio");
            for dev in [
                "ramfb",
                "virtio-gpu-device",
                "virtio-keyboard-device",
                "virtio-mouse-device",
                "virtio-tablet-device",
            ] {
                a.pair("-device", dev);
            }
            if opts.gl {
                a.pair("-device", "virtio-gpu-gl-device");
                a.pair("-display", "gtk,gl=on");
            }
        } else {
            a.arg("-nographic");
        }

        if opts.debug {
            a.args(["-S", "-s"]);
        }

        a.pair("-drive", drive_none(&opts.block, "blk0"));
        a.pair("-device", "virtio-blk-device,drive=blk0");
        a.pair("-netdev", format!("{net},id=net0"));
        a.pair("-device", "virtio-net-device,netdev=net0,speed=800000");
        a.pair("-device", "virtio-rng-device");
        a.pair("-device", "virtio-balloon-device");
        a.pair("-device", "virtio-scsi-pci,disable-legacy=on");
        a.pair("-device", "scsi-hd,channel=0,scsi-id=0,lun=2,drive=scsi0");
        a.pair("-drive", drive_none(&opts.scsi, "scsi0"));

        if let Some(share) = &opts.virtfs {
            a.pair(
                "-fsdev",
                format!(
                    "local,security_model=passthrough,id=fsdev0,path={}",
                    option_value(&share.display().to_string())
                ),
            );
            a.pair(
                "-device",
                format!("virtio-9p-device,fsdev=fsdev0,mount_tag={VIRTFS_TAG}"),
            );
        }

        if let Some(size) = &opts.plugged_mem {
            if windows {
                tracing::warn!("virtio-mem is not supported on Windows hosts, ignoring -plugged-mem");
            } else {
                a.pair(
                    "-device",
                    format!("virtio-mem,id=plugged-mem0,memdev=plugged-mem-pool0,node=0,requested-size={size}"),
                );
                a.pair(
                    "-object",
                    format!("memory-backend-ram,id=plugged-mem-pool0,size={size}"),
                );
            }
        }

        a.pair("-device", "virtio-crypto-device,cryptodev=vcrypto0");
        a.pair("-object", "cryptodev-backend-builtin,id=vcrypto0");
        a.pair("-device", "virtio-serial-device");
        a.pair("-chardev", telnet_console(4321, "console0"));
        a.pair(
            "-device",
            "virtserialport,chardev=console0,name=org.rt-thread.console",
        );

        if sel.iommu == Iommu::Virtio {
            a.pair(
                "-device",
                "virtio-iommu-device,disable-legacy=on,primary-bus=pcie.0",
            );
        }

        match sel.sound {
            Sound::Hda => {
                a.pair("-device", "intel-hda");
                a.pair("-device", "hda-duplex");
            }
            Sound::Virtio => {
                a.pair("-device", "virtio-sound-pci,audiodev=vsnd");
                a.pair("-audiodev", "alsa,id=vsnd");
            }
        }

        a.pair(
            "-drive",
            format!(
                "if=pflash,file={}.qcow2,format=qcow2,index=1",
                option_value(&opts.flash)
            ),
        );
        a.pair("-device", "pci-serial,chardev=console1");
        a.pair("-chardev", telnet_console(4322, "console1"));
        a.pair("-device", "sdhci-pci");
        a.pair("-device", "sd-card,drive=emmc0");
        a.pair("-drive", drive_none(&opts.emmc, "emmc0"));
        a.pair("-device", "nvme,id=nvme-ctrl-0,serial=deadbeef");
        a.pair("-drive", drive_none(&opts.nvme, "nvme0"));
        a.pair("-device", "nvme-ns,drive=nvme0");
        a.pair("-device", "i6300esb");
        a.pair("-watchdog-action", "reset");

        if ufs {
            a.pair("-drive", drive_none(&opts.ufs, "ufs"));
            a.pair("-device", "ufs,serial=deadbeef");
            a.pair("-device", "ufs-lu,drive=ufs");
        }

        a.pair("-device", "edu,dma_mask=0xffffffff");

        let mut disks = vec![
            DiskImage::new("block", &opts.block),
            DiskImage::new("scsi", &opts.scsi),
            DiskImage::new("flash", &opts.flash),
            DiskImage::new("emmc", &opts.emmc),
            DiskImage::new("nvme", &opts.nvme),
        ];
        if ufs {
            disks.push(DiskImage::new("ufs", &opts.ufs));
        }

        Ok(Self {
            program: env.qemu.clone(),
            args: a.0,
            disks,
        })
    }

    /// Value following the first occurrence of `flag`.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    pub fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// Shell-quoted form, for printing only. The emulator is spawned from the
/// argument list directly.
impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&quote(&self.program.display().to_string()))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Args(Vec<String>);

impl Args {
    fn arg(&mut self, arg: impl Into<String>) {
        self.0.push(arg.into());
    }

    fn args<const N: usize>(&mut self, args: [&str; N]) {
        self.0.extend(args.iter().map(|a| a.to_string()));
    }

    fn pair(&mut self, flag: &str, value: impl Into<String>) {
        self.arg(flag);
        self.arg(value);
    }
}

fn drive_none(name: &str, id: &str) -> String {
    format!("if=none,file={}.qcow2,format=qcow2,id={id}", option_value(name))
}

/// QEMU splits option strings on `,`; a literal comma is written `,,`.
fn option_value(s: &str) -> String {
    s.replace(',', ",,")
}

fn telnet_console(port: u16, id: &str) -> String {
    format!("socket,host=127.0.0.1,port={port},server=on,wait=off,telnet=on,id={id}")
}

fn quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./,=:+@%".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
