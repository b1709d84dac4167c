use crate::RankSet256;

#[test]
fn test_difference_preserves_rank_order() {
    let world = RankSet256::from_ranks(0..=7);
    let survivors = RankSet256::from_ranks([0, 2, 3, 6, 7]);
    let dead = world.difference(&survivors);
    assert_eq!(dead.ranks(), vec![1, 4, 5]);
    assert_eq!(dead.count(), 3);
}

#[test]
fn test_set_get_roundtrip() {
    let mut s = RankSet256::new();

    let mut state = 1234;

    fn lcg_rand_step(state: &mut u32) {
        *state = (*state as u64 * 279470273u64 % 0xfffffffb) as u32;
    }

    for _i in 0..256_u32 {
        lcg_rand_step(&mut state);
        let r = (state % 256) as u8;
        lcg_rand_step(&mut state);
        let val = state & 1 != 0;
        s.set(r, val);
        assert_eq!(s.get(r), val);
    }
}

#[test]
fn test_union_intersect_subtract() {
    let mut a = RankSet256::from_ranks([0, 1, 2, 250]);
    let b = RankSet256::from_ranks([2, 3, 250]);
    a.intersect(&b);
    assert_eq!(a.ranks(), vec![2, 250]);
    a.union(&RankSet256::from_ranks([7]));
    a.subtract(&RankSet256::from_ranks([250]));
    assert_eq!(a.ranks(), vec![2, 7]);
    a.clear_all();
    assert!(a.is_empty() && !a.any());
}
