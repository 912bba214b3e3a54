//! Register grouping (spec.md §4.2.2): fuse descriptors into the fewest
//! `ReadGroup`s possible subject to the invariants in spec.md §3.

use super::registers::{FunctionType, ReadGroup, RegisterDescriptor};

/// Compute once at plugin init and cache (spec.md §4.2.2).
///
/// Descriptors are sorted by `(function_type, address)` then swept
/// left-to-right, accumulating into the current group while both:
/// - `(next_addr + width) - group_start <= max_regs_per_read`
/// - `next_addr - last_member_addr <= max_register_gap` (gap measured from
///   the *start address* of the last-added descriptor, not the end of its
///   width — this is what makes a tight `max_register_gap` force a break
///   even when the last descriptor is wide)
/// A new group starts otherwise, or whenever the function type changes.
pub fn group_descriptors(
    descriptors: &[RegisterDescriptor],
    max_regs_per_read: u16,
    max_register_gap: u16,
) -> Vec<ReadGroup> {
    let mut order: Vec<usize> = (0..descriptors.len()).collect();
    order.sort_by_key(|&i| (function_rank(descriptors[i].function), descriptors[i].address));

    let mut groups: Vec<ReadGroup> = Vec::new();

    for idx in order {
        let d = &descriptors[idx];
        let fits_existing = groups.last().map(|g| {
            let last_member_address = descriptors[*g.members.last().unwrap()].address;
            g.function == d.function
                && (d.end_address() - g.start_address) <= max_regs_per_read
                && d.address.saturating_sub(last_member_address) <= max_register_gap
        });

        match fits_existing {
            Some(true) => {
                let g = groups.last_mut().unwrap();
                g.register_count = d.end_address() - g.start_address;
                g.members.push(idx);
            }
            _ => {
                groups.push(ReadGroup {
                    start_address: d.address,
                    register_count: d.width(),
                    function: d.function,
                    members: vec![idx],
                });
            }
        }
    }

    groups
}

fn function_rank(f: FunctionType) -> u8 {
    match f {
        FunctionType::Holding => 0,
        FunctionType::Input => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StandardKey;
    use crate::protocol::modbus::registers::{Priority, RegisterType};

    fn desc(address: u16, register_type: RegisterType) -> RegisterDescriptor {
        RegisterDescriptor {
            key: StandardKey::Unknown(format!("r{address}")),
            address,
            register_type,
            scale: 1.0,
            is_static: false,
            priority: Priority::Summary,
            function: FunctionType::Holding,
            little_endian_words: false,
        }
    }

    #[test]
    fn s1_single_group_within_gap() {
        // spec.md S1: {100:u16, 101:u16, 102:i32, 110:u16}, max_regs=60, gap=10
        let descs = vec![
            desc(100, RegisterType::U16),
            desc(101, RegisterType::U16),
            desc(102, RegisterType::I32),
            desc(110, RegisterType::U16),
        ];
        let groups = group_descriptors(&descs, 60, 10);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].start_address, 100);
        assert_eq!(groups[0].register_count, 11);
        let addrs: Vec<u16> = groups[0].members.iter().map(|&i| descs[i].address).collect();
        assert_eq!(addrs, vec![100, 101, 102, 110]);
    }

    #[test]
    fn s1_tighter_gap_splits_into_two() {
        let descs = vec![
            desc(100, RegisterType::U16),
            desc(101, RegisterType::U16),
            desc(102, RegisterType::I32),
            desc(110, RegisterType::U16),
        ];
        let groups = group_descriptors(&descs, 60, 7);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].start_address, 100);
        assert_eq!(groups[1].start_address, 110);
    }

    #[test]
    fn function_type_change_forces_break() {
        let mut descs = vec![desc(0, RegisterType::U16), desc(1, RegisterType::U16)];
        descs[1].function = FunctionType::Input;
        let groups = group_descriptors(&descs, 100, 100);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].function, FunctionType::Holding);
        assert_eq!(groups[1].function, FunctionType::Input);
    }

    #[test]
    fn grouping_optimality_bound() {
        // Invariant 1: groups <= ceil(S/M) + G
        let descs: Vec<_> = (0..50u16).map(|a| desc(a * 2, RegisterType::U16)).collect();
        let m = 20u16;
        let groups = group_descriptors(&descs, m, 1);
        let span = descs.last().unwrap().end_address() - descs[0].address;
        let forced_breaks = 0; // contiguous-ish with gap 1 allowed between 2-apart entries... computed loosely
        let bound = (span as f64 / m as f64).ceil() as usize + forced_breaks;
        assert!(groups.len() <= bound + 1, "groups={} bound={}", groups.len(), bound);
    }

    #[test]
    fn respects_max_regs_per_read_cap() {
        let descs: Vec<_> = (0..10u16).map(|a| desc(a, RegisterType::U16)).collect();
        let groups = group_descriptors(&descs, 4, 10);
        for g in &groups {
            assert!(g.register_count <= 4);
        }
    }
}
