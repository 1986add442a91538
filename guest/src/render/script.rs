use std::path::{Path, PathBuf};

use hostman_system::Arch;

use super::{Incoming, QemuBinary, QemuOptions, RenderContext, RenderError};
use crate::{
    desc::{IsolatedDevType, MONITOR_PORT_BASE, NicDriver},
    nic::nic_script_paths,
    paths::hugepages_dir,
};

/// Smallest MTU handed to a guest NIC.
const MIN_MTU: u32 = 576;

/// Tap down-scripts of every NIC, with the interface each expects as `$1`.
fn nic_down_scripts(ctx: &RenderContext<'_>) -> Result<Vec<(String, PathBuf)>, RenderError> {
    let paths = ctx.paths();
    let mut scripts = Vec::new();
    for nic in &ctx.desc.nics {
        if let Some((_, down)) = nic_script_paths(nic, ctx.host, &paths)? {
            scripts.push((nic.ifname.clone(), down));
        }
    }
    Ok(scripts)
}

fn run_down_script(ifname: &str, down: &Path) -> String {
    format!(
        "if [ -x {down} ]; then\n    {down} {ifname}\nfi",
        down = down.display()
    )
}

/// Binds each passthrough PCI function to vfio-pci.
fn passthrough_init(ctx: &RenderContext<'_>) -> Vec<String> {
    ctx.desc
        .isolated_devices
        .iter()
        .filter(|dev| dev.dev_type != IsolatedDevType::Usb)
        .map(|dev| {
            format!(
                "DEV=/sys/bus/pci/devices/{addr}\n\
                 echo vfio-pci > $DEV/driver_override\n\
                 if [ -e $DEV/driver ]; then\n    echo {addr} > $DEV/driver/unbind\nfi\n\
                 echo {addr} > /sys/bus/pci/drivers_probe",
                addr = dev.addr
            )
        })
        .collect()
}

fn disk_setup(ctx: &RenderContext<'_>) -> Vec<String> {
    ctx.desc
        .disks
        .iter()
        .map(|disk| {
            format!(
                "if [ ! -e {path} ]; then\n    echo \"disk {path} not found\" >&2\nfi",
                path = disk.path.display()
            )
        })
        .collect()
}

fn kvm_arg(ctx: &RenderContext<'_>) -> &'static str {
    if ctx.host.is_kvm_support() {
        "-enable-kvm"
    } else if ctx.host.arch() == Arch::X86_64 {
        "-no-kvm"
    } else {
        ""
    }
}

/// Probes the binary's virtio-net properties so unsupported ones are left out.
fn nic_helpers() -> String {
    format!(
        r#"function nic_speed() {{
    $QEMU_CMD -device virtio-net-pci,help 2>/dev/null | grep -q "speed=" && echo ",speed=$1"
}}

function nic_mtu() {{
    local bridge="$1"
    local cost="$2"
    $QEMU_CMD -device virtio-net-pci,help 2>/dev/null | grep -q "host_mtu=" || return 0
    local origmtu=$(cat /sys/class/net/$bridge/mtu 2>/dev/null)
    if [ -n "$origmtu" ] && [ "$origmtu" -gt {MIN_MTU} ]; then
        echo ",host_mtu=$((origmtu - cost))"
    fi
}}"#
    )
}

pub(super) fn start_script(
    ctx: &RenderContext<'_>,
    options: &QemuOptions,
) -> Result<String, RenderError> {
    let desc = ctx.desc;
    let paths = ctx.paths();
    let mut lines = vec!["#!/bin/bash".to_owned()];

    for (ifname, down) in nic_down_scripts(ctx)? {
        lines.push(run_down_script(&ifname, &down));
    }

    if ctx.host.is_hugepages_enabled() {
        let dir = hugepages_dir(&ctx.host.options().hugepages_path, desc.uuid());
        lines.push(format!("mkdir -p {}", dir.display()));
        lines.push(format!(
            "mount -t hugetlbfs -o pagesize={}K,size={}M hugetlbfs-{} {}",
            ctx.host.hugepage_size_kb(),
            desc.mem,
            desc.uuid(),
            dir.display()
        ));
    }

    lines.extend(disk_setup(ctx));
    lines.extend(passthrough_init(ctx));

    let incoming = ctx.incoming()?;
    if incoming == Incoming::StateFile {
        lines.push(format!(
            "STATE_FILE=`ls -d {}/STATEFILE* 2>/dev/null | head -n 1`",
            paths.home_dir().display()
        ));
    }

    let binary = QemuBinary::select(
        ctx.host.options(),
        ctx.overrides.qemu_version.as_deref(),
        ctx.host.arch(),
    );
    lines.push(format!(
        "DEFAULT_QEMU_CMD={}",
        shell_escape::escape(binary.path().display().to_string().into())
    ));
    lines.push("QEMU_CMD=$DEFAULT_QEMU_CMD".to_owned());
    lines.push(format!("QEMU_CMD_KVM_ARG={}", kvm_arg(ctx)));

    if desc.nics.iter().any(|nic| nic.driver == NicDriver::Virtio) {
        lines.push(nic_helpers());
    }

    lines.push(format!(
        "CMD=\"$QEMU_CMD $QEMU_CMD_KVM_ARG {}\"",
        options.to_script()
    ));

    if incoming == Incoming::StateFile {
        lines.push(
            r#"if [ -n "$STATE_FILE" ]; then
    if [ -d "$STATE_FILE" ] && [ -f "$STATE_FILE/content" ]; then
        CMD="$CMD --incoming \"exec: cat $STATE_FILE/content\""
    else
        CMD="$CMD --incoming \"exec: cat $STATE_FILE\""
    fi
fi"#
            .to_owned(),
        );
    }

    lines.push("echo \"$CMD\"".to_owned());
    Ok(lines.join("\n") + "\n")
}

pub(super) fn stop_script(ctx: &RenderContext<'_>) -> Result<String, RenderError> {
    let paths = ctx.paths();
    let mut lines = vec![
        "#!/bin/bash".to_owned(),
        format!("VNC_FILE={}", paths.vnc_file().display()),
        format!("PID_FILE={}", paths.pid_file().display()),
        format!(
            r#"if [ "$1" != "--force" ] && [ -f $VNC_FILE ]; then
    VNC=`cat $VNC_FILE`
    MON=$(($VNC + {MONITOR_PORT_BASE}))
    echo quit | nc -w 1 127.0.0.1 $MON > /dev/null 2>&1
    sleep 1
fi
rm -f $VNC_FILE
if [ -f $PID_FILE ]; then
    PID=`cat $PID_FILE`
    if ps -p $PID > /dev/null; then
        kill -9 $PID
    fi
    rm -f $PID_FILE
fi"#
        ),
    ];

    for (ifname, down) in nic_down_scripts(ctx)? {
        lines.push(run_down_script(&ifname, &down));
    }

    let hugepages = hugepages_dir(&ctx.host.options().hugepages_path, ctx.desc.uuid());
    lines.push(format!(
        r#"for d in {}*; do
    if [ -d "$d" ]; then
        umount "$d" > /dev/null 2>&1
        rm -rf "$d"
    fi
done"#,
        hugepages.display()
    ));

    Ok(lines.join("\n") + "\n")
}
