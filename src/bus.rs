//! The graph interior: a source that sums its children.

use crossbeam_channel::Sender;

use crate::command::{BusCommandKind, Command};
use crate::error::{push_error, Error, ErrorCode};
use crate::object_pool::{ObjectPool, SourceRef};
use crate::pool::Handle;
use crate::source::{self, ReadCtx, SourceBase};

/// A source whose output is the sum of its children's outputs.
///
/// The master bus is the root of the graph: it has no parent, feeds the
/// device, and cannot be released by client code.
pub struct Bus {
    pub(crate) base: SourceBase,
    pub(crate) children: Vec<SourceRef>,
    pub(crate) parent: Option<Handle<Bus>>,
    pub(crate) is_master: bool,
}

impl Bus {
    pub(crate) fn new(base: SourceBase, parent: Option<Handle<Bus>>, is_master: bool) -> Self {
        Self {
            base,
            children: Vec::new(),
            parent,
            is_master,
        }
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub fn parent(&self) -> Option<Handle<Bus>> {
        self.parent
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn children(&self) -> &[SourceRef] {
        &self.children
    }
}

/// Whether `candidate` appears on `bus`'s parent chain (including `bus`
/// itself). Used to reject appends that would close a cycle.
fn is_self_or_ancestor(objects: &ObjectPool, candidate: Handle<Bus>, bus: Handle<Bus>) -> bool {
    let mut at = Some(bus);
    while let Some(current) = at {
        if current == candidate {
            return true;
        }
        at = objects.get(current).and_then(|b| b.parent);
    }
    false
}

/// Apply a bus command on the mix thread. Stale targets are skipped.
pub(crate) fn apply_bus_command(objects: &mut ObjectPool, target: Handle<Bus>, kind: BusCommandKind) {
    match kind {
        BusCommandKind::AppendSource { source } => apply_append_source(objects, target, source),
        BusCommandKind::RemoveSource { source } => apply_remove_source(objects, target, source),
    }
}

pub(crate) fn apply_append_source(objects: &mut ObjectPool, target: Handle<Bus>, source: SourceRef) {
    if !objects.is_valid(target) || !source.is_valid(objects) {
        return;
    }

    // A sub-bus moves: it leaves its previous parent and must not create a
    // cycle by being appended to itself or a descendant.
    if let SourceRef::Bus(sub) = source {
        if is_self_or_ancestor(objects, sub, target) {
            push_error(Error::new(
                ErrorCode::Logic,
                "appending a bus to itself or a descendant",
            ));
            return;
        }
        let previous = objects.get(sub).and_then(|b| b.parent);
        if let Some(previous) = previous {
            apply_remove_source(objects, previous, source);
        }
        if let Some(sub_bus) = objects.get_mut(sub) {
            sub_bus.parent = Some(target);
        }
    }

    if let Some(bus) = objects.get_mut(target) {
        bus.children.push(source);
    }
}

pub(crate) fn apply_remove_source(objects: &mut ObjectPool, target: Handle<Bus>, source: SourceRef) {
    if let Some(bus) = objects.get_mut(target) {
        if let Some(at) = bus.children.iter().position(|child| *child == source) {
            bus.children.remove(at);
        }
    }
}

/// Sum every child into `out`. Children are pulled four at a time so their
/// buffers can be accumulated in one pass; the stragglers go one by one.
/// A bus always reports a full buffer; silence comes from children producing
/// zeroed output.
pub(crate) fn read_impl(
    objects: &mut ObjectPool,
    ctx: &mut ReadCtx,
    handle: Handle<Bus>,
    out: &mut [f32],
) -> usize {
    let len = out.len();
    let Some(bus) = objects.get_mut(handle) else {
        return 0;
    };
    let children = std::mem::take(&mut bus.children);

    let mut quads = children.chunks_exact(4);
    for quad in &mut quads {
        for child in quad {
            source::read_source(objects, ctx, *child, len);
        }
        let bufs = [
            child_output(objects, quad[0], len),
            child_output(objects, quad[1], len),
            child_output(objects, quad[2], len),
            child_output(objects, quad[3], len),
        ];
        if let [Some(a), Some(b), Some(c), Some(d)] = bufs {
            for i in 0..len {
                out[i] += a[i] + b[i] + c[i] + d[i];
            }
        } else {
            for buf in bufs.into_iter().flatten() {
                for (acc, sample) in out.iter_mut().zip(buf) {
                    *acc += *sample;
                }
            }
        }
    }

    for child in quads.remainder() {
        source::read_source(objects, ctx, *child, len);
        if let Some(buf) = child_output(objects, *child, len) {
            for (acc, sample) in out.iter_mut().zip(buf) {
                *acc += *sample;
            }
        }
    }

    if let Some(bus) = objects.get_mut(handle) {
        bus.children = children;
    }
    len
}

fn child_output(objects: &ObjectPool, child: SourceRef, len: usize) -> Option<&[f32]> {
    child
        .base(objects)
        .map(|base| &base.out_buffer[..len])
}

/// Assign this node's clock down the tree so every child sees its parent's
/// timeline. Called after each master pull.
pub(crate) fn update_parent_clock(objects: &mut ObjectPool, source: SourceRef, parent_clock: u32) {
    let Some(base) = source.base_mut(objects) else {
        return;
    };
    base.parent_clock = parent_clock;

    if let SourceRef::Bus(handle) = source {
        let clock = base.clock;
        let children = match objects.get_mut(handle) {
            Some(bus) => std::mem::take(&mut bus.children),
            None => return,
        };
        for child in &children {
            update_parent_clock(objects, *child, clock);
        }
        if let Some(bus) = objects.get_mut(handle) {
            bus.children = children;
        }
    }
}

/// Remove children flagged for discard, depth first, returning their slots to
/// the pool. Runs inside `Engine::update` after commands are drained.
pub(crate) fn process_removals(objects: &mut ObjectPool, handle: Handle<Bus>) {
    let Some(bus) = objects.get_mut(handle) else {
        return;
    };
    let mut children = std::mem::take(&mut bus.children);

    children.retain(|child| {
        if !child.is_valid(objects) {
            return false;
        }
        if let SourceRef::Bus(sub) = child {
            process_removals(objects, *sub);
        }
        let discard = child.base(objects).map_or(true, |base| base.should_discard);
        if discard {
            destroy_source(objects, *child);
        }
        !discard
    });

    if let Some(bus) = objects.get_mut(handle) {
        bus.children = children;
    }
}

/// Return a source's slot to its pool.
pub(crate) fn destroy_source(objects: &mut ObjectPool, source: SourceRef) {
    match source {
        SourceRef::Pcm(h) => {
            objects.remove(h);
        }
        SourceRef::Stream(h) => {
            objects.remove(h);
        }
        SourceRef::Bus(h) => {
            objects.remove(h);
        }
    }
}

/// Run release logic on a bus.
///
/// Non-recursive release re-parents the children onto the master bus through
/// deferred append commands; recursive release releases the whole subtree.
/// Either way the bus itself is flagged for the next sweep.
pub(crate) fn release_bus(
    objects: &mut ObjectPool,
    deferred: &Sender<Command>,
    master: Handle<Bus>,
    handle: Handle<Bus>,
    recursive: bool,
) {
    let children = match objects.get(handle) {
        Some(bus) => bus.children.clone(),
        None => return,
    };

    if recursive {
        for child in children {
            match child {
                SourceRef::Bus(sub) => release_bus(objects, deferred, master, sub, true),
                other => source::release_source_base(objects, other),
            }
        }
    } else {
        for child in children {
            if child.is_valid(objects) {
                let _ = deferred.send(Command::bus_append_source(master, child));
            }
        }
    }

    source::release_source_base(objects, SourceRef::Bus(handle));
}
