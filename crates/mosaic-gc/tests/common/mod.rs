//! Shared object model and helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use mosaic_gc::{Collector, GcConfig, Mutator, NoHooks, ObjectLayout, ObjectModel, ObjectRef};

/// No references.
pub const LEAF: usize = 1;
/// Two reference slots.
pub const PAIR: usize = 2;
/// Word 0 is the length, then that many reference slots.
pub const ARRAY: usize = 3;
/// Word 0 is the length, then that many two-word elements whose second word
/// is a reference.
pub const STRUCTS: usize = 4;

pub struct TestModel;

fn len_and_begin(obj: ObjectRef) -> (usize, *const *mut u8) {
    // SAFETY: arrays are allocated with a length word in front.
    unsafe {
        let len = obj.as_ptr().cast::<usize>().read();
        (len, obj.as_ptr().cast::<*mut u8>().add(1))
    }
}

// SAFETY: every layout below matches how the helpers allocate objects.
unsafe impl ObjectModel for TestModel {
    fn layout(&self, obj: ObjectRef) -> ObjectLayout {
        match obj.type_tag() {
            PAIR => ObjectLayout::Fields8(&[0, 1]),
            ARRAY => {
                let (len, begin) = len_and_begin(obj);
                ObjectLayout::ObjArray { begin, len, step: 1 }
            }
            STRUCTS => {
                let (len, begin) = len_and_begin(obj);
                ObjectLayout::Array8 {
                    begin,
                    len,
                    elsize: 2,
                    fields: &[1],
                }
            }
            _ => ObjectLayout::Leaf,
        }
    }
}

/// Serial marking and sweeping, no allocation-triggered collections.
pub fn serial_config() -> GcConfig {
    let mut config = GcConfig::new(0);
    config.set_auto_collect(false);
    config
}

pub fn collector(config: GcConfig) -> Arc<Collector> {
    Collector::new(config, TestModel, NoHooks).expect("collector")
}

pub fn leaf(m: &Mutator, size: usize) -> ObjectRef {
    m.alloc(size, LEAF).expect("alloc leaf")
}

pub fn pair(m: &Mutator, a: Option<ObjectRef>, b: Option<ObjectRef>) -> ObjectRef {
    let p = m.alloc(16, PAIR).expect("alloc pair");
    // SAFETY: pairs have two slots.
    unsafe {
        p.store_slot_raw(0, a);
        p.store_slot_raw(1, b);
    }
    p
}

pub fn array(m: &Mutator, elems: &[ObjectRef]) -> ObjectRef {
    let a = m.alloc(8 * (elems.len() + 1), ARRAY).expect("alloc array");
    // SAFETY: the payload holds the length word and every element.
    unsafe {
        a.as_ptr().cast::<usize>().write(elems.len());
        for (i, e) in elems.iter().enumerate() {
            a.store_slot_raw(i + 1, Some(*e));
        }
    }
    a
}

pub fn structs(m: &Mutator, elems: &[ObjectRef]) -> ObjectRef {
    let a = m.alloc(8 * (2 * elems.len() + 1), STRUCTS).expect("alloc structs");
    // SAFETY: as above, with two words per element.
    unsafe {
        a.as_ptr().cast::<usize>().write(elems.len());
        for (i, e) in elems.iter().enumerate() {
            a.as_ptr().cast::<usize>().add(1 + 2 * i).write(i);
            a.store_slot_raw(2 + 2 * i, Some(*e));
        }
    }
    a
}

/// Writes `value` into the first payload word.
pub fn stamp(obj: ObjectRef, value: usize) {
    // SAFETY: every test object has at least one payload word.
    unsafe { obj.as_ptr().cast::<usize>().write(value) };
}

pub fn stamp_of(obj: ObjectRef) -> usize {
    // SAFETY: as above.
    unsafe { obj.as_ptr().cast::<usize>().read() }
}

/// A linked list of `n` pairs; returns the head.
pub fn list(m: &Mutator, n: usize) -> ObjectRef {
    let mut head = None;
    for _ in 0..n {
        head = Some(pair(m, head, None));
    }
    head.expect("non-empty list")
}
