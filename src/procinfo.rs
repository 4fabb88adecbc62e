//! OS process inspection: liveness, descendants, CPU time and owner.
//!
//! Every query takes a fresh `sysinfo` snapshot restricted to what it needs.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use sysinfo::{
    Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind, Users,
};

fn snapshot(pids: ProcessesToUpdate<'_>, kind: ProcessRefreshKind) -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(pids, true, kind);
    system
}

fn is_live(process: &Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// Whether `pid` is a live process. Zombies count as dead.
pub fn is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let system = snapshot(ProcessesToUpdate::Some(&[pid]), ProcessRefreshKind::nothing());
    system.process(pid).is_some_and(is_live)
}

/// Live descendants of `pid`, parents listed before their children.
pub fn descendants(pid: u32) -> Vec<u32> {
    let system = snapshot(ProcessesToUpdate::All, ProcessRefreshKind::nothing());
    let pairs = system
        .processes()
        .iter()
        .filter_map(|(child, process)| Some((child.as_u32(), process.parent()?.as_u32())));
    let live = |pid: &u32| {
        system
            .process(Pid::from_u32(*pid))
            .is_some_and(is_live)
    };
    let mut found = walk_tree(pid, children_map(pairs));
    found.retain(live);
    found
}

/// CPU time (user and system) consumed so far by `pid`.
pub fn cpu_time(pid: u32) -> Option<Duration> {
    let pid = Pid::from_u32(pid);
    let system = snapshot(
        ProcessesToUpdate::Some(&[pid]),
        ProcessRefreshKind::nothing().with_cpu(),
    );
    let process = system.process(pid).filter(|process| is_live(process))?;
    Some(Duration::from_millis(process.accumulated_cpu_time()))
}

/// Name of the user owning `pid`.
pub fn owner_user(pid: u32) -> Option<String> {
    let pid = Pid::from_u32(pid);
    let system = snapshot(
        ProcessesToUpdate::Some(&[pid]),
        ProcessRefreshKind::nothing().with_user(UpdateKind::Always),
    );
    let uid = system.process(pid)?.user_id()?;
    let users = Users::new_with_refreshed_list();
    users.get_user_by_id(uid).map(|user| user.name().to_string())
}

fn children_map(pairs: impl IntoIterator<Item = (u32, u32)>) -> HashMap<u32, Vec<u32>> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, ppid) in pairs {
        children.entry(ppid).or_default().push(pid);
    }
    children
}

// Breadth-first, so a parent always precedes its children.
fn walk_tree(root: u32, children: HashMap<u32, Vec<u32>>) -> Vec<u32> {
    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(parent) = queue.pop_front() {
        for child in children.get(&parent).into_iter().flatten() {
            if *child != root && !found.contains(child) {
                found.push(*child);
                queue.push_back(*child);
            }
        }
    }
    found
}
