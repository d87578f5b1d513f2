//! 配额与注册表的属性测试
//!
//! - 任意操作序列后，客户端用量等于其名下结构大小之和
//! - 并发预留不会突破预算，记录的用量等于成功预留之和

use acc2_api::models::{StructureFormat, StructureRecord};
use acc2_api::services::{QuotaPolicy, QuotaTracker};
use acc2_api::storage::{Requester, StructureRegistry};
use proptest::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

const CLIENTS: [&str; 3] = ["alice", "bob", "carol"];

#[derive(Debug, Clone)]
enum Op {
    Upload { client: usize, size: u64 },
    Remove { client: usize, index: usize },
    Expire { index: usize },
    Decay,
    LongCalc { client: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..CLIENTS.len(), 1u64..400).prop_map(|(client, size)| Op::Upload { client, size }),
        2 => (0..CLIENTS.len(), 0usize..16).prop_map(|(client, index)| Op::Remove { client, index }),
        1 => (0usize..16).prop_map(|index| Op::Expire { index }),
        1 => Just(Op::Decay),
        1 => (0..CLIENTS.len()).prop_map(|client| Op::LongCalc { client }),
    ]
}

fn record(id: String, owner: &str, size: u64) -> StructureRecord {
    StructureRecord {
        path: PathBuf::from(format!("/nonexistent/acc2/{}/{}.pdb", id, id)),
        filename: format!("{}.pdb", id),
        id,
        owner: owner.to_string(),
        size,
        format: StructureFormat::Pdb,
        last_touched: SystemTime::now(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// used_bytes 始终等于名下结构大小之和，且从不为负
    #[test]
    fn prop_used_bytes_matches_registry(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let registry = StructureRegistry::new();
        let quota = QuotaTracker::new(QuotaPolicy {
            enabled: true,
            granted_space: 1000,
            max_long_calc: 3,
        });
        let mut next_id = 0usize;

        for op in ops {
            match op {
                Op::Upload { client, size } => {
                    let owner = CLIENTS[client];
                    if quota.try_reserve(owner, size) {
                        next_id += 1;
                        registry.register(record(format!("s{}", next_id), owner, size)).unwrap();
                    }
                }
                Op::Remove { client, index } => {
                    let owner = CLIENTS[client];
                    let ids = registry.ids_snapshot();
                    if let Some(id) = ids.get(index % ids.len().max(1)) {
                        let _ = registry.release_with(id, Requester::Client(owner), |r| {
                            quota.release(&r.owner, r.size)
                        });
                    }
                }
                Op::Expire { index } => {
                    let ids = registry.ids_snapshot();
                    if let Some(id) = ids.get(index % ids.len().max(1)) {
                        let _ = registry.release_if(id, |_| true, |r| quota.release(&r.owner, r.size));
                    }
                }
                Op::Decay => {
                    quota.decay_tick();
                }
                Op::LongCalc { client } => quota.record_long_calculation(CLIENTS[client]),
            }

            let usage = registry.usage_by_owner();
            for client in CLIENTS {
                let expected = usage.get(client).copied().unwrap_or(0);
                prop_assert_eq!(quota.used_bytes(client), expected);
                prop_assert!(quota.used_bytes(client) <= 1000);
            }
            prop_assert!(registry.check_consistency().is_ok());
        }
    }

    /// 并发预留的结果与某个串行顺序一致
    #[test]
    fn prop_concurrent_reserve_is_linearizable(
        sizes in prop::collection::vec(1u64..100, 2..24),
        budget in 50u64..800,
    ) {
        let quota = Arc::new(QuotaTracker::new(QuotaPolicy {
            enabled: true,
            granted_space: budget,
            max_long_calc: 1,
        }));

        let handles: Vec<_> = sizes
            .iter()
            .map(|&size| {
                let quota = quota.clone();
                std::thread::spawn(move || (size, quota.try_reserve("client", size)))
            })
            .collect();

        let results: Vec<(u64, bool)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let admitted: u64 = results.iter().filter(|(_, ok)| *ok).map(|(size, _)| size).sum();

        prop_assert!(admitted <= budget);
        prop_assert_eq!(quota.used_bytes("client"), admitted);
        // 被拒绝的请求在拒绝时确实放不下
        let smallest_rejected = results.iter().filter(|(_, ok)| !*ok).map(|(s, _)| *s).min();
        if let Some(size) = smallest_rejected {
            prop_assert!(admitted + size > budget);
        }
    }

    /// 衰减 n 次后计数归零，不会出现负数
    #[test]
    fn prop_decay_reaches_zero(recorded in 0u32..20, ticks in 0usize..30) {
        let quota = QuotaTracker::new(QuotaPolicy {
            enabled: true,
            granted_space: 1,
            max_long_calc: 5,
        });
        for _ in 0..recorded {
            quota.record_long_calculation("client");
        }
        for _ in 0..ticks {
            quota.decay_tick();
        }
        let expected = recorded.saturating_sub(ticks as u32);
        prop_assert_eq!(quota.long_calc_count("client"), expected);
        prop_assert_eq!(quota.is_rate_limited("client"), expected >= 5);
    }
}
