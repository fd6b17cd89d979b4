use crate::trace::def::{Arg, BoxRef, Const, Descr, Operation};
use crate::trace::opcode::Opcode;
use rustc_hash::FxHashMap;

pub type ValueId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Unknown,
    NonNull,
    Constant,
}

#[derive(Debug, Clone)]
pub struct VirtualInfo {
    pub source_op: Operation,
    pub fields: Vec<(String, ValueId)>,
}

/// What the optimizer knows about one value. Several boxes may share a
/// value after CSE or `same_as`; `box_` is the one the sink emits.
#[derive(Debug, Clone)]
pub struct OptValue {
    pub id: ValueId,
    pub box_: Arg,
    pub level: Level,
    pub fromstart: bool,
    pub known_class: Option<Const>,
    pub virtual_: Option<VirtualInfo>,
}

impl OptValue {
    pub fn is_constant(&self) -> bool {
        self.level == Level::Constant
    }

    pub fn is_virtual(&self) -> bool {
        self.virtual_.is_some()
    }

    pub fn is_nonnull(&self) -> bool {
        match self.level {
            Level::Constant => self.get_constant().is_some_and(|c| c.is_true()),
            Level::NonNull => true,
            Level::Unknown => false,
        }
    }

    pub fn get_constant(&self) -> Option<Const> {
        if self.level == Level::Constant {
            self.box_.as_const()
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
pub struct ValueTable {
    slots: Vec<OptValue>,
    by_box: FxHashMap<BoxRef, ValueId>,
    consts: FxHashMap<Const, ValueId>,
    pub forced: usize,
}

impl ValueTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, box_: Arg, level: Level) -> ValueId {
        let id = self.slots.len();
        self.slots.push(OptValue {
            id,
            box_,
            level,
            fromstart: false,
            known_class: None,
            virtual_: None,
        });
        id
    }

    pub fn getvalue(&mut self, arg: Arg) -> ValueId {
        match arg {
            Arg::Const(c) => {
                if let Some(&vid) = self.consts.get(&c) {
                    return vid;
                }
                let vid = self.add(arg, Level::Constant);
                self.consts.insert(c, vid);
                vid
            }
            Arg::Box(b) => {
                if let Some(&vid) = self.by_box.get(&b) {
                    return vid;
                }
                let vid = self.add(arg, Level::Unknown);
                self.by_box.insert(b, vid);
                vid
            }
        }
    }

    pub fn lookup(&self, b: BoxRef) -> Option<ValueId> {
        self.by_box.get(&b).copied()
    }

    pub fn get(&self, vid: ValueId) -> &OptValue {
        &self.slots[vid]
    }

    pub fn get_mut(&mut self, vid: ValueId) -> &mut OptValue {
        &mut self.slots[vid]
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut OptValue> {
        self.slots.iter_mut()
    }

    /// Forwards `b` to an existing value; later uses of `b` read that value.
    pub fn make_equal_to(&mut self, b: BoxRef, vid: ValueId) {
        self.by_box.insert(b, vid);
    }

    pub fn make_constant(&mut self, vid: ValueId, c: Const) {
        let slot = &mut self.slots[vid];
        slot.level = Level::Constant;
        slot.box_ = Arg::Const(c);
        slot.virtual_ = None;
    }

    pub fn make_nonnull(&mut self, vid: ValueId) {
        let slot = &mut self.slots[vid];
        if slot.level < Level::NonNull {
            slot.level = Level::NonNull;
        }
    }

    /// Turns the result of an allocation into a virtual object. Returns
    /// `None` when the operation has no result box.
    pub fn make_virtual(&mut self, op: Operation) -> Option<ValueId> {
        let result = op.result?;
        let vid = self.getvalue(Arg::Box(result));
        let slot = &mut self.slots[vid];
        slot.level = Level::NonNull;
        slot.virtual_ = Some(VirtualInfo {
            source_op: op,
            fields: Vec::new(),
        });
        Some(vid)
    }

    pub fn setfield(&mut self, vid: ValueId, name: &str, value: ValueId) {
        let Some(info) = self.slots[vid].virtual_.as_mut() else {
            return;
        };
        match info.fields.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => info.fields.push((name.to_string(), value)),
        }
    }

    pub fn getfield(&self, vid: ValueId, name: &str) -> Option<ValueId> {
        self.slots[vid]
            .virtual_
            .as_ref()?
            .fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    /// Materializes a value. A virtual emits its allocation and field writes
    /// into `out` the first time; every later call returns the same box.
    pub fn force_box(&mut self, vid: ValueId, out: &mut Vec<Operation>) -> Arg {
        let Some(info) = self.slots[vid].virtual_.take() else {
            return self.slots[vid].box_;
        };
        let keybox = self.slots[vid].box_;
        self.forced += 1;
        out.push(info.source_op);
        for (name, field) in info.fields {
            let value = self.force_box(field, out);
            out.push(
                Operation::new(Opcode::SetfieldGc, vec![keybox, value], None)
                    .with_descr(Descr::Field(name)),
            );
        }
        keybox
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::def::{BoxPool, Kind};

    #[test]
    fn constants_share_one_slot() {
        let mut values = ValueTable::new();
        let a = values.getvalue(Arg::Const(Const::Int(3)));
        let b = values.getvalue(Arg::Const(Const::Int(3)));
        assert_eq!(a, b);
        assert_eq!(values.get(a).get_constant(), Some(Const::Int(3)));
    }

    #[test]
    fn forwarding_reads_through() {
        let mut pool = BoxPool::new();
        let x = pool.fresh_box(Kind::Int);
        let y = pool.fresh_box(Kind::Int);
        let mut values = ValueTable::new();
        let vx = values.getvalue(Arg::Box(x));
        values.make_equal_to(y, vx);
        assert_eq!(values.getvalue(Arg::Box(y)), vx);
        values.make_constant(vx, Const::Int(9));
        assert_eq!(values.get(values.lookup(y).unwrap()).get_constant(), Some(Const::Int(9)));
    }

    #[test]
    fn nested_virtuals_force_once_in_order() {
        let mut pool = BoxPool::new();
        let outer = pool.fresh_box(Kind::Ref);
        let inner = pool.fresh_box(Kind::Ref);
        let mut values = ValueTable::new();
        let vo = values
            .make_virtual(Operation::new(Opcode::New, vec![], Some(outer)))
            .unwrap();
        let vi = values
            .make_virtual(Operation::new(Opcode::New, vec![], Some(inner)))
            .unwrap();
        values.setfield(vo, "next", vi);
        let seven = values.getvalue(Arg::Const(Const::Int(7)));
        values.setfield(vi, "value", seven);

        let mut out = Vec::new();
        assert_eq!(values.force_box(vo, &mut out), Arg::Box(outer));
        let ops: Vec<_> = out.iter().map(|op| op.opnum).collect();
        assert_eq!(
            ops,
            vec![Opcode::New, Opcode::New, Opcode::SetfieldGc, Opcode::SetfieldGc]
        );
        assert_eq!(out[2].args, vec![Arg::Box(inner), Arg::Const(Const::Int(7))]);
        assert_eq!(out[3].args, vec![Arg::Box(outer), Arg::Box(inner)]);

        assert_eq!(values.force_box(vo, &mut out), Arg::Box(outer));
        assert_eq!(out.len(), 4);
        assert_eq!(values.forced, 2);
    }
}
