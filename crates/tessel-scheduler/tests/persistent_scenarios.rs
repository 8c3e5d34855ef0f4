//! End-to-end persistent scheduling scenarios
//!
//! Each test builds a small fusion, runs it through the gates, derives the
//! parameters and, where eligible, applies the schedule.

use tessel_gpu::DeviceInfo;
use tessel_ir::{
    BinaryOpType, DataType, Dim, ExprKind, ExpressionEvaluator, Fusion, IterDomain, ParallelType,
    TvId,
};
use tessel_scheduler::{
    PersistentScheduler, PersistentSchedulerHelper, ScheduleHeuristic, SchedulerRuntimeInfo,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn runtime(n: i64, k: i64) -> SchedulerRuntimeInfo {
    init_tracing();
    SchedulerRuntimeInfo::new(
        ExpressionEvaluator::new().with("n", n).with("k", k),
        DeviceInfo::mock(),
    )
}

fn parallel_types(fusion: &Fusion, tv: TvId) -> Vec<ParallelType> {
    fusion.tv(tv).leaf.iter().map(|id| id.parallel).collect()
}

/// t1 = t0 * t0; t2 = sum(t1, 1); t4 = t1 / broadcast(t2)
fn mul_sum_normalize(fusion: &mut Fusion) -> TvId {
    let t0 = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
    let t1 = fusion.binary(BinaryOpType::Mul, t0, t0).unwrap();
    let t2 = fusion.sum(t1, &[1]).unwrap();
    let t3 = fusion.broadcast(t2, &[false, true]).unwrap();
    let t4 = fusion.binary(BinaryOpType::Div, t1, t3).unwrap();
    fusion.add_output(t4);
    t2
}

// ============================================================
// Compile-time gates
// ============================================================

mod gates {
    use super::*;

    #[test]
    fn test_mul_feeding_sum_is_eligible() {
        let mut fusion = Fusion::new();
        mul_sum_normalize(&mut fusion);
        let helper = PersistentSchedulerHelper::default();
        let h = ScheduleHeuristic::InnerPersistent;

        assert!(helper.leading_common_compile_time_check(&fusion, h).is_ok());
        let reduction_tvs = fusion.reduction_tvs();
        assert_eq!(reduction_tvs.len(), 1);
        assert!(helper.check_reduction_type(&fusion, &reduction_tvs, h).is_ok());
        assert!(helper
            .compile_time_check_reduction_axis(&fusion, &reduction_tvs, h)
            .is_ok());
        assert!(helper
            .trailing_common_compile_time_check(&fusion, &reduction_tvs, h)
            .is_ok());
        assert!(helper.common_compile_time_check(&fusion, h).is_ok());
    }

    #[test]
    fn test_mma_rejected_by_leading_gate() {
        init_tracing();
        let mut fusion = Fusion::new();
        mul_sum_normalize(&mut fusion);
        let a = fusion.add_input(DataType::Half, [16_i64, 8]);
        let b = fusion.add_input(DataType::Half, [8_i64, 16]);
        let c = fusion.mma(a, b).unwrap();
        fusion.add_output(c);

        let err = PersistentSchedulerHelper::default()
            .common_compile_time_check(&fusion, ScheduleHeuristic::InnerPersistent)
            .unwrap_err();
        assert_eq!(err.message, "no support for mma ops.");
        assert_eq!(
            err.to_string(),
            "scheduler _inner_persistent_ rejected because: no support for mma ops."
        );
    }

    #[test]
    fn test_inconsistent_root_size() {
        let mut fusion = Fusion::new();
        let wide = fusion.add_input(
            DataType::Float,
            [Dim::sym("m"), Dim::sym("n"), Dim::sym("k")],
        );
        let narrow = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let r3 = fusion.sum(wide, &[2]).unwrap();
        let r2 = fusion.sum(narrow, &[1]).unwrap();
        fusion.add_output(r3);
        fusion.add_output(r2);

        let err = PersistentSchedulerHelper::default()
            .trailing_common_compile_time_check(
                &fusion,
                &[r3, r2],
                ScheduleHeuristic::InnerPersistent,
            )
            .unwrap_err();
        assert_eq!(
            err.message,
            format!("inconsistent reduction root size: {}, expected: 3", fusion.tv(r2))
        );
    }

    #[test]
    fn test_lookup_of_intermediate_rejected() {
        let mut fusion = Fusion::new();
        let reference = mul_sum_normalize(&mut fusion);
        let idx = fusion.add_input(DataType::Int, [4_i64]);
        let picked = fusion.index_select(reference, 0, idx).unwrap();
        fusion.add_output(picked);

        let err = PersistentSchedulerHelper::default()
            .common_compile_time_check(&fusion, ScheduleHeuristic::InnerPersistent)
            .unwrap_err();
        assert!(err.message.starts_with("index_select reads"));
    }

    #[test]
    fn test_select_through_broadcast_index_rejected() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let table = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let idx = fusion
            .add_input_with_root(DataType::Int, [IterDomain::broadcast()].into_iter().collect());
        let row = fusion.index_select(table, 0, idx).unwrap();
        let t1 = fusion.binary(BinaryOpType::Add, t0, row).unwrap();
        let t2 = fusion.sum(t1, &[1]).unwrap();
        let t3 = fusion.broadcast(t2, &[false, true]).unwrap();
        let t4 = fusion.binary(BinaryOpType::Div, t1, t3).unwrap();
        fusion.add_output(t4);

        let err = PersistentSchedulerHelper::default()
            .trailing_common_compile_time_check(
                &fusion,
                &fusion.reduction_tvs(),
                ScheduleHeuristic::InnerPersistent,
            )
            .unwrap_err();
        assert_eq!(err.message, "has unsupported gather-like ops before normalization");
    }
}

// ============================================================
// Full pipeline
// ============================================================

mod pipeline {
    use super::*;

    #[test]
    fn test_inner_persistent_layer_norm() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Half, [Dim::sym("n"), Dim::sym("k")]);
        let t1 = fusion.cast(t0, DataType::Float).unwrap();
        let t2 = fusion.sum(t1, &[1]).unwrap();
        let t3 = fusion.broadcast(t2, &[false, true]).unwrap();
        let t4 = fusion.binary(BinaryOpType::Sub, t1, t3).unwrap();
        let t5 = fusion.cast(t4, DataType::Half).unwrap();
        fusion.add_output(t5);

        let scheduler = PersistentScheduler::new(ScheduleHeuristic::InnerPersistent).unwrap();
        let rt = runtime(4096, 2048);
        scheduler.can_schedule_compile_time(&fusion).unwrap();
        scheduler.can_schedule_run_time(&fusion, &rt).unwrap().unwrap();
        let params = scheduler.compute_heuristics(&fusion, &rt).unwrap().unwrap();
        assert!(params.persistent_kernel);
        assert!(params.project_persistent_buffers);
        assert_eq!(params.unroll_factor_inner_reduction, 8);

        let reference = scheduler.schedule(&mut fusion, &params).unwrap();
        assert_eq!(reference, t2);
        let parallel = parallel_types(&fusion, reference);
        assert!(parallel.contains(&ParallelType::BIDx));
        assert!(parallel.contains(&ParallelType::TIDx));
        assert!(parallel.contains(&ParallelType::Vectorize));
        // t1 now only feeds the reduction; the subtraction recomputes it.
        assert_eq!(fusion.uses(t1).count(), 1);
    }

    #[test]
    fn test_outer_persistent_spreads_over_grid() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let t1 = fusion.sum(t0, &[0]).unwrap();
        let t2 = fusion.broadcast(t1, &[true, false]).unwrap();
        let t3 = fusion.binary(BinaryOpType::Sub, t0, t2).unwrap();
        fusion.add_output(t3);

        let scheduler = PersistentScheduler::new(ScheduleHeuristic::OuterPersistent).unwrap();
        let rt = runtime(8192, 4096);
        scheduler.can_schedule_compile_time(&fusion).unwrap();
        let params = scheduler.compute_heuristics(&fusion, &rt).unwrap().unwrap();
        assert!(params.cross_grid_inner_reduction);
        assert!(!params.fastest_dim);
        let launch = params.launch_params;
        assert_eq!(launch.total_blocks(), Some(108));

        let reference = scheduler.schedule(&mut fusion, &params).unwrap();
        let parallel = parallel_types(&fusion, reference);
        for expected in [
            ParallelType::BIDx,
            ParallelType::TIDx,
            ParallelType::BIDy,
            ParallelType::TIDy,
            ParallelType::Vectorize,
        ] {
            assert!(parallel.contains(&expected), "missing {expected:?}");
        }
    }

    #[test]
    fn test_grid_outer_groups_sibling_reductions() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Float, [Dim::sym("n"), Dim::sym("k")]);
        let t1 = fusion.sum(t0, &[0]).unwrap();
        let t2 = fusion.broadcast(t1, &[true, false]).unwrap();
        let t3 = fusion.binary(BinaryOpType::Sub, t0, t2).unwrap();
        let t4 = fusion.binary(BinaryOpType::Mul, t0, t0).unwrap();
        let t5 = fusion.sum(t4, &[0]).unwrap();
        fusion.add_output(t3);
        fusion.add_output(t5);

        let scheduler = PersistentScheduler::new(ScheduleHeuristic::OuterPersistent).unwrap();
        let rt = runtime(8192, 4096);
        scheduler.can_schedule_compile_time(&fusion).unwrap();
        let params = scheduler.compute_heuristics(&fusion, &rt).unwrap().unwrap();
        assert!(params.cross_grid_inner_reduction);
        assert!(!params.fastest_dim);

        let reference = scheduler.schedule(&mut fusion, &params).unwrap();
        let grouped: Vec<_> = fusion
            .exprs()
            .filter_map(|expr| match &expr.kind {
                ExprKind::GroupedReduction { outputs, .. } => Some(outputs.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].len(), 2);
        assert!(grouped[0].contains(&reference));
        assert!(!fusion
            .exprs()
            .any(|expr| matches!(expr.kind, ExprKind::Reduction { .. })));
    }

    #[test]
    fn test_inner_outer_layer_norm_backward() {
        let mut fusion = Fusion::new();
        let t0 = fusion.add_input(DataType::Half, [Dim::sym("n"), Dim::sym("k")]);
        let t1 = fusion.cast(t0, DataType::Float).unwrap();
        let inner = fusion.sum(t1, &[1]).unwrap();
        let bc = fusion.broadcast(inner, &[false, true]).unwrap();
        let t4 = fusion.binary(BinaryOpType::Sub, t1, bc).unwrap();
        let outer = fusion.sum(t1, &[0]).unwrap();
        fusion.add_output(t4);
        fusion.add_output(outer);

        let scheduler =
            PersistentScheduler::new(ScheduleHeuristic::InnerOuterPersistent).unwrap();
        let rt = runtime(2048, 1024);
        scheduler.can_schedule_compile_time(&fusion).unwrap();
        let params = scheduler.compute_heuristics(&fusion, &rt).unwrap().unwrap();
        assert!(params.combined_inner_outer);
        assert!(params.project_persistent_buffers);
        assert!(!params.shared_mem_persistent_buffer);
        assert_eq!(params.launch_params.bdimx, Some(256));
        assert_eq!(params.launch_params.gdimy, Some(108));

        let reference = scheduler.schedule(&mut fusion, &params).unwrap();
        assert_eq!(reference, inner);
        assert!(parallel_types(&fusion, inner).contains(&ParallelType::TIDx));
    }

    #[test]
    fn test_wrong_kind_rejected_before_heuristics() {
        let mut fusion = Fusion::new();
        mul_sum_normalize(&mut fusion);
        let scheduler =
            PersistentScheduler::new(ScheduleHeuristic::InnerOuterPersistent).unwrap();
        let err = scheduler.can_schedule_compile_time(&fusion).unwrap_err();
        assert_eq!(err.message, "ReductionType and heuristic doesn't match.");
    }
}
