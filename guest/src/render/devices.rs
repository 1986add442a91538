use hostman_system::Arch;

use super::{Incoming, QemuOptions, RenderContext, RenderError, TLS_CREDS_ID};
use crate::{
    desc::{
        Device, DiskDriver, Firmware, GuestDesc, IsolatedDevType, IsolatedDevice, Monitor,
        NicDriver, Object, OsName, VNC_PORT_BASE, Vdi,
    },
    nic::resolve_bridge,
    options::BridgeDriver,
};

/// Id of the secret object unlocking encrypted disks.
const ENCRYPT_KEY_ID: &str = "encrypt-key";

pub(super) fn qemu_options(ctx: &RenderContext<'_>) -> Result<QemuOptions, RenderError> {
    let desc = ctx.desc;
    let options = ctx.host.options();
    let paths = ctx.paths();
    let mut qemu = QemuOptions::new();

    let name = if desc.name.is_empty() {
        desc.uuid()
    } else {
        desc.name.as_str()
    };
    qemu.name(name);
    if options.enable_vm_uuid {
        qemu.uuid(desc.uuid());
    }

    for monitor in [
        Monitor::hmp(ctx.overrides.vnc_port),
        Monitor::qmp(ctx.overrides.vnc_port),
    ] {
        let chardev_id = monitor.chardev_id();
        qemu.chardev(format!(
            "socket,id={chardev_id},port={},host=127.0.0.1,nodelay=on,server=on,wait=off",
            monitor.port
        ))
        .opt(
            "mon",
            format!(
                "chardev={chardev_id},id={},mode={}",
                monitor.id,
                monitor.mode.as_str()
            ),
        );
    }

    let rtc_base = if desc.metadata.os_name == OsName::Windows {
        "localtime"
    } else {
        "utc"
    };
    qemu.opt("rtc", format!("base={rtc_base},clock=host,driftfix=none"));

    let machine = desc
        .machine_desc
        .as_ref()
        .ok_or_else(|| ctx.unprepared("machine"))?;
    let cpu = desc.cpu_desc.as_ref().ok_or_else(|| ctx.unprepared("cpu"))?;
    let mem = desc
        .mem_desc
        .as_ref()
        .ok_or_else(|| ctx.unprepared("memory"))?;

    qemu.opt("machine", machine.machine_arg())
        .opt("cpu", cpu.cpu_arg())
        .opt("smp", cpu.smp_arg());

    qemu.opt("m", mem.memory_arg())
        .object(&mem.mem)
        .numa_memdev(&mem.mem.id);
    for slot in &mem.mem_slots {
        qemu.object(&slot.mem_obj).device(slot.device_arg());
    }

    match &machine.firmware {
        Some(Firmware::Pflash(path)) => {
            qemu.uefi_pflash(path);
        }
        Some(Firmware::Bios(path)) => {
            qemu.bios(path);
        }
        None => {}
    }

    qemu.nodefaults();

    if desc.gpus_has_vga() {
        qemu.opt("vga", "none");
    } else if ctx.host.arch() == Arch::Aarch64 {
        qemu.device(Device::new("virtio-gpu-pci", "video0"));
    } else if desc.vdi == Vdi::Spice {
        qemu.opt("vga", "qxl");
    } else {
        qemu.opt("vga", "std");
    }

    pci_controllers(&mut qemu, desc);

    qemu.device(Device::new(
        desc.metadata.usb_controller_type.device_model(),
        &desc.usb.id,
    ));
    for input in usb_input_devices(desc, ctx.host.arch()) {
        qemu.device(input);
    }

    let encrypt_key = ctx.encrypt_key_file();
    if let Some(key_file) = &encrypt_key {
        qemu.object(
            Object::new("secret", ENCRYPT_KEY_ID)
                .with("file", key_file.display().to_string())
                .with("format", "base64"),
        );
    }
    disks(&mut qemu, desc, encrypt_key.is_some());

    for nic in &desc.nics {
        if nic.driver == NicDriver::Vfio {
            continue;
        }
        let bridge = resolve_bridge(nic, ctx.host)?;
        let up = paths.nic_up_script(&bridge.device, &nic.ifname);
        let down = paths.nic_down_script(&bridge.device, &nic.ifname);

        let mut netdev = format!(
            "tap,id={ifname},ifname={ifname},script={},downscript={}",
            up.display(),
            down.display(),
            ifname = nic.ifname
        );
        if nic.driver == NicDriver::Virtio && ctx.host.is_kvm_support() {
            netdev.push_str(",vhost=on");
        }
        qemu.opt("netdev", netdev);

        let device = Device::new(nic.driver.device_model(), format!("netdev-{}", nic.ifname))
            .with("netdev", &nic.ifname)
            .with("mac", &nic.mac);
        if nic.driver == NicDriver::Virtio {
            let encap_cost = match bridge.driver {
                BridgeDriver::Openvswitch => options.ovn_encap_cost,
                BridgeDriver::Linux => 0,
            };
            let mut probes = String::new();
            if let Some(bw) = nic.bw {
                probes.push_str(&format!("$(nic_speed {bw})"));
            }
            probes.push_str(&format!("$(nic_mtu {} {encap_cost})", bridge.device));
            qemu.opt_with_probes("device", device, probes);
        } else {
            qemu.device(device);
        }
    }

    for dev in &desc.isolated_devices {
        qemu.device(isolated_device(dev, &desc.usb.id));
    }

    if let Some(qga) = &desc.qga {
        qemu.chardev(&qga.socket)
            .device(&qga.serial_bus)
            .device(&qga.port);
    }
    if let Some(pvpanic) = &desc.pvpanic
        && !desc.metadata.disable_pvpanic
    {
        qemu.device(&pvpanic.device);
    }
    if let Some(serial) = &desc.isa_serial
        && !desc.metadata.disable_isa_serial
    {
        qemu.chardev(&serial.chardev).device(&serial.device);
    }

    match desc.vdi {
        Vdi::Vnc => qemu.vnc(ctx.overrides.vnc_port, options.set_vnc_password),
        Vdi::Spice => qemu.spice(VNC_PORT_BASE + ctx.overrides.vnc_port),
    };

    if options.enable_qemu_debug_log {
        qemu.opt("d", "guest_errors")
            .opt("D", ctx.home.join("qemu-debug.log").display());
    }

    for (key, value) in &desc.extra_options {
        for value in value.values() {
            if value.is_empty() {
                qemu.flag(key);
            } else {
                qemu.opt(key, value);
            }
        }
    }

    match ctx.incoming()? {
        Incoming::Tcp { port } => {
            qemu.incoming(&format!("tcp:0:{port}"));
        }
        Incoming::Defer { .. } => {
            qemu.object(
                Object::new("tls-creds-x509", TLS_CREDS_ID)
                    .with("dir", paths.pki_dir().display().to_string())
                    .with("endpoint", "server")
                    .with("verify-peer", "on"),
            )
            .incoming("defer");
        }
        // Appended by the start script only when a state file exists.
        Incoming::StateFile => {}
    }

    Ok(qemu)
}

fn pci_controllers(qemu: &mut QemuOptions, desc: &GuestDesc) {
    use crate::desc::PciControllerType;

    let root = desc.machine_or_default().root_bus();
    for ctrl in &desc.pci_controllers {
        let bus = ctrl.bus.as_deref().unwrap_or(root);
        let chassis = ctrl.chassis.unwrap_or(1).to_string();
        let device = match ctrl.ctype {
            PciControllerType::PcieRoot | PciControllerType::PciRoot => continue,
            PciControllerType::PciBridge => Device::new("pci-bridge", &ctrl.id)
                .with("bus", bus)
                .with("chassis_nr", chassis),
            PciControllerType::PcieRootPort => Device::new("pcie-root-port", &ctrl.id)
                .with("bus", bus)
                .with("chassis", chassis),
            PciControllerType::PcieToPciBridge => {
                Device::new("pcie-pci-bridge", &ctrl.id).with("bus", bus)
            }
        };
        qemu.device(device);
    }
    if desc.pci_controllers.is_empty()
        && desc.metadata.pcie_extend_bus
        && desc.machine_or_default().is_pcie()
    {
        qemu.device(Device::new("pcie-pci-bridge", "pci.1").with("bus", root));
    }
}

/// Input devices for the guest's USB controller.
pub(super) fn usb_input_devices(desc: &GuestDesc, arch: Arch) -> Vec<Device> {
    let bus = format!("{}.0", desc.usb.id);
    let meta = &desc.metadata;

    let drivers: Vec<&str> = if arch == Arch::Aarch64 {
        vec!["usb-tablet", "usb-kbd"]
    } else {
        let mut drivers = Vec::new();
        let no_kbd = meta.distribution_is(OsName::OpenWrt)
            || meta.distribution_is(OsName::Cirros)
            || meta.is_old_windows()
            || meta.is_windows_10()
            || meta.disable_usb_kbd;
        if !no_kbd {
            drivers.push("usb-kbd");
        }
        if meta.os_name == OsName::Android {
            drivers.push("usb-mouse");
        } else if !meta.is_old_windows() {
            drivers.push("usb-tablet");
        }
        drivers
    };

    drivers
        .into_iter()
        .enumerate()
        .map(|(idx, driver)| {
            Device::new(driver, format!("input{idx}"))
                .with("bus", &bus)
                .with("port", (idx + 1).to_string())
        })
        .collect()
}

fn disks(qemu: &mut QemuOptions, desc: &GuestDesc, has_encrypt_key: bool) {
    let mut controllers: Vec<&str> = Vec::new();
    for disk in &desc.disks {
        let controller = match disk.driver {
            DiskDriver::Scsi => Some(("virtio-scsi-pci", "scsi")),
            DiskDriver::Pvscsi => Some(("pvscsi", "pvscsi")),
            DiskDriver::Sata => Some(("ahci", "ahci0")),
            DiskDriver::Virtio | DiskDriver::Ide => None,
        };
        if let Some((model, id)) = controller
            && !controllers.contains(&id)
        {
            controllers.push(id);
            qemu.device(Device::new(model, id));
        }
    }

    for disk in &desc.disks {
        let drive_id = format!("drive_{}", disk.index);
        let mut drive = format!(
            "file={},if=none,id={drive_id},format={},cache={},aio={}",
            disk.path.display(),
            disk.format,
            disk.cache_mode,
            disk.aio_mode
        );
        if disk.encrypt && has_encrypt_key {
            drive.push_str(&format!(
                ",encrypt.format=luks,encrypt.key-secret={ENCRYPT_KEY_ID}"
            ));
        }
        qemu.drive(drive);

        let dev_id = format!("{drive_id}-dev");
        let device = match disk.driver {
            DiskDriver::Virtio => Device::new("virtio-blk-pci", dev_id),
            DiskDriver::Scsi => Device::new("scsi-hd", dev_id).with("bus", "scsi.0"),
            DiskDriver::Pvscsi => Device::new("scsi-hd", dev_id).with("bus", "pvscsi.0"),
            DiskDriver::Ide => Device::new("ide-hd", dev_id),
            DiskDriver::Sata => {
                Device::new("ide-hd", dev_id).with("bus", format!("ahci0.{}", disk.index))
            }
        };
        qemu.device(
            device
                .with("drive", drive_id)
                .with("bootindex", disk.index.to_string()),
        );
    }
}

fn isolated_device(dev: &IsolatedDevice, usb_id: &str) -> Device {
    match dev.dev_type {
        IsolatedDevType::Usb => {
            let (bus, addr) = dev.addr.split_once(':').unwrap_or((dev.addr.as_str(), "0"));
            Device::new("usb-host", format!("usb-host-{bus}-{addr}"))
                .with("bus", format!("{usb_id}.0"))
                .with("hostbus", bus)
                .with("hostaddr", addr)
        }
        IsolatedDevType::GpuHpc | IsolatedDevType::GpuVga | IsolatedDevType::Nic => {
            let id = format!("vfio-{}", dev.addr.replace([':', '.'], "-"));
            let device = Device::new("vfio-pci", id).with("host", &dev.addr);
            if dev.dev_type == IsolatedDevType::GpuVga {
                device.with("x-vga", "on")
            } else {
                device
            }
        }
    }
}
