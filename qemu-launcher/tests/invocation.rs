use qemu_launcher::options::DEFAULT_BOOTARGS;
use qemu_launcher::{Environment, Host, Invocation, Options, QemuVersion, Selection, UsageError};

const LINUX: Host = Host { windows: false };
const WINDOWS: Host = Host { windows: true };

fn assemble_on(flags: &[&str], version: QemuVersion, host: Host) -> Result<Invocation, UsageError> {
    let opts = Options::parse(flags.iter().copied())?;
    let sel = Selection::resolve(&opts)?;
    Invocation::assemble(&opts, &sel, &Environment::new(version, host))
}

fn assemble(flags: &[&str]) -> Invocation {
    assemble_on(flags, QemuVersion::new(8, 2, 0), LINUX).expect("assemble")
}

fn count_pair(inv: &Invocation, flag: &str, value: &str) -> usize {
    inv.args
        .windows(2)
        .filter(|w| w[0] == flag && w[1] == value)
        .count()
}

fn has_device(inv: &Invocation, device: &str) -> bool {
    count_pair(inv, "-device", device) > 0
}

fn machine(inv: &Invocation) -> &str {
    inv.value_of("-M").expect("machine")
}

#[test]
fn no_flags_gives_a_complete_default_invocation() {
    let inv = assemble(&[]);
    assert_eq!(inv.program.to_str(), Some("qemu-system-aarch64"));
    assert_eq!(count_pair(&inv, "-m", "128"), 1);
    assert_eq!(count_pair(&inv, "-smp", "4"), 1);
    assert_eq!(machine(&inv), "virt,acpi=on,iommu=smmuv3,its=on,gic-version=2");
    assert_eq!(inv.value_of("-cpu"), Some("max"));
    assert_eq!(inv.value_of("-kernel"), Some("rtthread.bin"));
    assert_eq!(inv.value_of("-append"), Some(DEFAULT_BOOTARGS));
    assert_eq!(inv.value_of("-netdev"), Some("user,hostfwd=tcp::12055-:22,id=net0"));
    assert!(inv.args.iter().any(|a| a == "-nographic"));
    assert!(has_device(&inv, "intel-hda") && has_device(&inv, "hda-duplex"));
    assert!(!inv.args.iter().any(|a| a == "-S" || a == "-dtb" || a == "-initrd"));
    assert_eq!(inv.args.last().map(String::as_str), Some("edu,dma_mask=0xffffffff"));
}

#[test]
fn many_cpus_select_gic_max() {
    let inv = assemble(&["-smp", "12"]);
    assert!(machine(&inv).contains("gic-version=max"), "{}", machine(&inv));
    assert_eq!(count_pair(&inv, "-smp", "12"), 1);
}

#[test]
fn exception_levels_map_to_machine_flags() {
    assert!(machine(&assemble(&["-el", "2"])).ends_with("gic-version=2,virtualization=on"));
    assert!(machine(&assemble(&["-el", "2", "-gic", "3"])).ends_with("gic-version=max,virtualization=on"));
    assert!(machine(&assemble(&["-el", "3"])).ends_with(",secure=on"));
    assert_eq!(
        assemble_on(&["-el", "5"], QemuVersion::new(8, 2, 0), LINUX),
        Err(UsageError::InvalidExceptionLevel(5))
    );
}

#[test]
fn gl_without_graphic_is_rejected() {
    assert_eq!(
        assemble_on(&["-gl"], QemuVersion::new(8, 2, 0), LINUX),
        Err(UsageError::GlWithoutGraphic)
    );
}

#[test]
fn graphic_mode_adds_display_devices() {
    let inv = assemble(&["-graphic", "-gl"]);
    assert!(!inv.args.iter().any(|a| a == "-nographic"));
    assert_eq!(inv.value_of("-serial"), Some("stdio"));
    for dev in ["ramfb", "virtio-gpu-device", "virtio-keyboard-device", "virtio-tablet-device", "virtio-gpu-gl-device"] {
        assert!(has_device(&inv, dev), "missing {dev}");
    }
    assert_eq!(inv.value_of("-display"), Some("gtk,gl=on"));
    assert_eq!(inv.value_of("-append"), Some(DEFAULT_BOOTARGS));

    let windows = assemble_on(&["-graphic"], QemuVersion::new(8, 2, 0), WINDOWS).expect("assemble");
    assert!(windows.value_of("-append").expect("append").ends_with(" ramfb.buffer_size=1"));
}

#[test]
fn virtio_iommu_replaces_smmu() {
    let inv = assemble(&["-iommu", "virtio"]);
    assert_eq!(machine(&inv), "virt,acpi=on,its=on,gic-version=2");
    assert!(has_device(&inv, "virtio-iommu-device,disable-legacy=on,primary-bus=pcie.0"));

    assert_eq!(
        assemble_on(&["-iommu", "amd"], QemuVersion::new(8, 2, 0), LINUX),
        Err(UsageError::InvalidIommu("amd".to_string()))
    );
}

#[test]
fn virtio_sound_is_version_gated() {
    let err = assemble_on(&["-sound", "virtio"], QemuVersion::new(8, 1, 3), LINUX).unwrap_err();
    assert!(matches!(err, UsageError::VirtioSoundUnsupported { .. }));

    let inv = assemble(&["-sound", "virtio"]);
    assert!(has_device(&inv, "virtio-sound-pci,audiodev=vsnd"));
    assert_eq!(inv.value_of("-audiodev"), Some("alsa,id=vsnd"));
    assert!(!has_device(&inv, "intel-hda"));

    let newer = assemble_on(&["-sound", "virtio"], QemuVersion::new(10, 0, 0), LINUX);
    assert!(newer.is_ok());
}

#[test]
fn ufs_only_on_new_qemu() {
    let old = assemble_on(&[], QemuVersion::new(7, 2, 0), LINUX).expect("assemble");
    let roles: Vec<_> = old.disks.iter().map(|d| d.role).collect();
    assert_eq!(roles, ["block", "scsi", "flash", "emmc", "nvme"]);
    assert!(!has_device(&old, "ufs-lu,drive=ufs"));

    let new = assemble(&["-ufs", "fast"]);
    assert_eq!(new.disks.len(), 6);
    assert_eq!(new.disks[5].file_name().to_str(), Some("fast.qcow2"));
    assert_eq!(count_pair(&new, "-drive", "if=none,file=fast.qcow2,format=qcow2,id=ufs"), 1);
    assert!(has_device(&new, "ufs-lu,drive=ufs"));
}

#[test]
fn disk_names_follow_flags() {
    let inv = assemble(&["-block", "rootfs", "-flash", "nor", "-emmc", "sd", "-nvme", "ssd"]);
    assert_eq!(count_pair(&inv, "-drive", "if=none,file=rootfs.qcow2,format=qcow2,id=blk0"), 1);
    assert_eq!(count_pair(&inv, "-drive", "if=pflash,file=nor.qcow2,format=qcow2,index=1"), 1);
    assert_eq!(count_pair(&inv, "-drive", "if=none,file=sd.qcow2,format=qcow2,id=emmc0"), 1);
    assert_eq!(count_pair(&inv, "-drive", "if=none,file=ssd.qcow2,format=qcow2,id=nvme0"), 1);
    assert_eq!(count_pair(&inv, "-drive", "if=none,file=scsi.qcow2,format=qcow2,id=scsi0"), 1);
}

#[test]
fn tap_network_has_no_ssh_forward() {
    let inv = assemble(&["-tap", "-ssh", "2222"]);
    assert_eq!(inv.value_of("-netdev"), Some("tap,ifname=tap0,script=no,downscript=no,id=net0"));

    let windows = assemble_on(&["-tap"], QemuVersion::new(8, 2, 0), WINDOWS).expect("assemble");
    assert_eq!(windows.value_of("-netdev"), Some("tap,ifname=tap0,id=net0"));

    let user = assemble(&["-ssh", "2222"]);
    assert_eq!(user.value_of("-netdev"), Some("user,hostfwd=tcp::2222-:22,id=net0"));
}

#[test]
fn virtfs_share_adds_device_and_bootargs() {
    let inv = assemble(&["-9p", "/srv/share", "-bootargs", "console=ttyAMA0"]);
    assert_eq!(
        inv.value_of("-fsdev"),
        Some("local,security_model=passthrough,id=fsdev0,path=/srv/share")
    );
    assert!(has_device(&inv, "virtio-9p-device,fsdev=fsdev0,mount_tag=hostshare"));
    assert_eq!(
        inv.value_of("-append"),
        Some("console=ttyAMA0 9p.tag=hostshare 9p.mount=host")
    );
}

#[test]
fn plugged_memory_is_skipped_on_windows() {
    let inv = assemble(&["-plugged-mem", "256M"]);
    assert!(has_device(
        &inv,
        "virtio-mem,id=plugged-mem0,memdev=plugged-mem-pool0,node=0,requested-size=256M"
    ));
    assert_eq!(count_pair(&inv, "-object", "memory-backend-ram,id=plugged-mem-pool0,size=256M"), 1);

    let windows = assemble_on(&["-plugged-mem", "256M"], QemuVersion::new(8, 2, 0), WINDOWS).expect("assemble");
    assert!(!windows.args.iter().any(|a| a.starts_with("virtio-mem")));
}

#[test]
fn optional_boot_inputs() {
    let inv = assemble(&["-debug", "-dtb", "board.dtb", "-initrd", "initrd.img", "-dumpdtb", "out.dtb"]);
    assert_eq!(inv.value_of("-dtb"), Some("board.dtb"));
    assert_eq!(inv.value_of("-initrd"), Some("initrd.img"));
    assert!(inv.args.windows(2).any(|w| w == ["-S", "-s"]));
    assert_eq!(machine(&inv), "virt,acpi=on,iommu=smmuv3,its=on,gic-version=2,dumpdtb=out.dtb");
}

#[test]
fn custom_binary_and_kernel() {
    let opts = Options::default();
    let sel = Selection::resolve(&opts).expect("resolve");
    let env = Environment::new(QemuVersion::new(9, 0, 0), LINUX)
        .with_qemu("/opt/qemu/bin/qemu-system-aarch64")
        .with_kernel("build/rtthread.bin");
    let inv = Invocation::assemble(&opts, &sel, &env).expect("assemble");
    assert_eq!(inv.program.to_str(), Some("/opt/qemu/bin/qemu-system-aarch64"));
    assert_eq!(inv.value_of("-kernel"), Some("build/rtthread.bin"));
}

#[test]
fn printed_command_quotes_boot_arguments() {
    let line = assemble(&[]).to_string();
    assert!(line.starts_with("qemu-system-aarch64 -M virt,acpi=on,iommu=smmuv3,its=on,gic-version=2 -cpu max"));
    assert!(line.contains(&format!("-append '{DEFAULT_BOOTARGS}'")));
}

#[test]
fn json_form_lists_program_args_and_disks() {
    let inv = assemble(&[]);
    let value = serde_json::to_value(&inv).expect("serialize");
    assert_eq!(value["program"], "qemu-system-aarch64");
    assert_eq!(value["args"].as_array().map(Vec::len), Some(inv.args.len()));
    assert_eq!(value["disks"][0]["role"], "block");
    assert_eq!(value["disks"][0]["name"], "block");
}

#[test]
fn commas_in_paths_are_escaped_for_qemu() {
    let inv = assemble(&["-dumpdtb", "/work/a,b/qemu.tmp.dtb", "-9p", "/srv/x,y"]);
    assert!(machine(&inv).ends_with(",dumpdtb=/work/a,,b/qemu.tmp.dtb"), "{}", machine(&inv));
    assert_eq!(
        inv.value_of("-fsdev"),
        Some("local,security_model=passthrough,id=fsdev0,path=/srv/x,,y")
    );
}
