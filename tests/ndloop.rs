use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strided_narray::{
    cast, copy, ndloop, ndloop_into, plan, store, DType, ErrorKind, InArg, IndexExpr,
    KernelContext, LoopOptions, LoopSupport, NArray, NArrayError, NdFunc, OutArg, Result, Stridx,
};

fn binary(support: LoopSupport) -> NdFunc {
    NdFunc::new(
        vec![
            InArg::new(Some(DType::Float64)),
            InArg::new(Some(DType::Float64)),
        ],
        vec![OutArg::new(DType::Float64)],
    )
    .with_support(support)
}

fn mul(ctx: &KernelContext<'_>) -> Result<()> {
    ctx.for_each(|offs| {
        let x: f64 = ctx.read(0, offs[0]);
        let y: f64 = ctx.read(1, offs[1]);
        ctx.write(2, offs[2], x * y);
        Ok(())
    })
}

fn random_array(rng: &mut StdRng, shape: &[usize]) -> NArray {
    let size: usize = shape.iter().product();
    NArray::from_vec(shape, (0..size).map(|_| rng.gen_range(-1.0..1.0)).collect::<Vec<f64>>())
        .unwrap()
}

#[test]
fn test_outer_product_plan_steps() {
    let a = NArray::zeros(DType::Float64, &[3, 1]);
    let b = NArray::zeros(DType::Float64, &[1, 4]);
    let out = NArray::zeros(DType::Float64, &[3, 4]);
    let p = plan(&binary(LoopSupport::Element), &[&a, &b], &[&out], &LoopOptions::default())
        .unwrap();
    assert_eq!(p.shape, vec![3, 4]);
    assert_eq!(p.operands[0].steps[1], Stridx::Stride(0));
    assert_eq!(p.operands[1].steps[0], Stridx::Stride(0));
}

#[test]
fn test_length_one_operand_never_moves() {
    for n in [1usize, 2, 7, 100] {
        let a = NArray::zeros(DType::Float64, &[1]);
        let b = NArray::zeros(DType::Float64, &[n]);
        let out = NArray::zeros(DType::Float64, &[n]);
        let p = plan(&binary(LoopSupport::Element), &[&a, &b], &[&out], &LoopOptions::default())
            .unwrap();
        assert_eq!(p.len(), n);
        assert!(p.operands[0]
            .steps
            .iter()
            .chain(std::iter::once(&p.operands[0].inner))
            .all(|s| *s == Stridx::Stride(0)));
    }
}

#[test]
fn test_results_do_not_depend_on_loop_support() {
    let mut rng = StdRng::seed_from_u64(42);
    let a = random_array(&mut rng, &[4, 1, 6]);
    let b = random_array(&mut rng, &[5, 1]);
    // Reversed view so the planner sees a negative stride.
    let b = b.aref(&[IndexExpr::Reverse, IndexExpr::All]).unwrap();

    let reference = ndloop(
        &binary(LoopSupport::Element),
        &[&a, &b],
        &LoopOptions::default(),
        mul,
    )
    .unwrap()
    .remove(0);
    assert_eq!(reference.shape(), &[4, 5, 6]);

    let av = a.to_vec::<f64>().unwrap();
    let bv = b.to_vec::<f64>().unwrap();
    let rv = reference.to_vec::<f64>().unwrap();
    for i in 0..4 {
        for j in 0..5 {
            for k in 0..6 {
                assert_relative_eq!(rv[(i * 5 + j) * 6 + k], av[i * 6 + k] * bv[j], epsilon = 1e-12);
            }
        }
    }

    for support in [
        LoopSupport::Contiguous,
        LoopSupport::Strided,
        LoopSupport::Gathered,
    ] {
        let out = ndloop(&binary(support), &[&a, &b], &LoopOptions::default(), mul)
            .unwrap()
            .remove(0);
        assert_eq!(out.to_vec::<f64>().unwrap(), rv, "{support:?}");
    }
}

#[test]
fn test_gathered_operand() {
    let a = NArray::from_vec(&[5], vec![1.0f64, 2.0, 3.0, 4.0, 5.0]).unwrap();
    let g = a.aref(&[IndexExpr::List(vec![4, 0, 2])]).unwrap();
    let w = NArray::from_vec(&[3], vec![10.0f64, 100.0, 1000.0]).unwrap();
    for support in [LoopSupport::Strided, LoopSupport::Gathered] {
        let out = ndloop(&binary(support), &[&g, &w], &LoopOptions::default(), mul).unwrap();
        assert_eq!(out[0].to_vec::<f64>().unwrap(), vec![50.0, 100.0, 3000.0]);
    }
}

#[test]
fn test_reduce_marked_by_index() {
    let a = NArray::from_vec(&[2, 3], vec![1i64, 2, 3, 4, 5, 6]).unwrap();
    let marked = a.aref(&[IndexExpr::Reduce, IndexExpr::All]).unwrap();
    let func = NdFunc::new(
        vec![InArg::new(None)],
        vec![OutArg::new(DType::Int64).with_init(0.0)],
    );
    let out = ndloop(&func, &[&marked], &LoopOptions::reduce_marked(&marked), |ctx| {
        ctx.for_each(|offs| {
            let x: i64 = ctx.read(0, offs[0]);
            let acc: i64 = ctx.read(1, offs[1]);
            ctx.write(1, offs[1], acc + x);
            Ok(())
        })
    })
    .unwrap();
    assert_eq!(out[0].shape(), &[3]);
    assert_eq!(out[0].to_vec::<i64>().unwrap(), vec![5, 7, 9]);
}

#[test]
fn test_kernel_rank_hands_rows_to_kernel() {
    let a = NArray::from_vec(&[2, 3], vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let func = NdFunc::new(
        vec![InArg::new(Some(DType::Float64)).with_kernel_rank(1)],
        vec![OutArg::new(DType::Float64)],
    );
    let out = ndloop(&func, &[&a], &LoopOptions::default(), |ctx| {
        let n = ctx.kernel_shape(0)[0];
        let step = ctx.kernel_stridx(0)[0].clone();
        let mut total = 0.0;
        for k in 0..n {
            let off = (ctx.offset(0) as isize + step.offset_at(k)) as usize;
            total += ctx.read::<f64>(0, off);
        }
        ctx.write(1, ctx.offset(1), total);
        Ok(())
    })
    .unwrap();
    assert_eq!(out[0].shape(), &[2]);
    assert_eq!(out[0].to_vec::<f64>().unwrap(), vec![6.0, 15.0]);
}

#[test]
fn test_errors_leave_outputs_untouched() {
    let a = NArray::from_vec(&[2, 3], vec![1.0f64; 6]).unwrap();
    let b = NArray::from_vec(&[4], vec![1.0f64; 4]).unwrap();
    let out = NArray::zeros(DType::Float64, &[2, 3]);
    let err = ndloop_into(
        &binary(LoopSupport::Element),
        &[&a, &b],
        &[&out],
        &LoopOptions::default(),
        |_| -> Result<()> { panic!("kernel must not run") },
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Shape);
    assert_eq!(out.to_vec::<f64>().unwrap(), vec![0.0; 6]);
}

#[test]
fn test_kernel_error_is_propagated() {
    let a = NArray::from_vec(&[3], vec![1.0f64, 0.0, 2.0]).unwrap();
    let func = NdFunc::new(
        vec![InArg::new(Some(DType::Float64))],
        vec![OutArg::new(DType::Float64)],
    );
    let err = ndloop(&func, &[&a], &LoopOptions::default(), |ctx| {
        let x: f64 = ctx.read(0, ctx.offset(0));
        if x == 0.0 {
            return Err(NArrayError::Kernel("division by zero".into()));
        }
        ctx.write(1, ctx.offset(1), 1.0 / x);
        Ok(())
    })
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Kernel);
    assert_eq!(err.to_string(), "kernel failed: division by zero");
}

#[test]
fn test_store_then_copy_through_views() {
    let a = NArray::zeros(DType::Int32, &[3, 4]);
    let block = a
        .aref(&[IndexExpr::from(0isize..2), IndexExpr::Reverse])
        .unwrap();
    store(&block, &NArray::from_vec(&[4], vec![1i32, 2, 3, 4]).unwrap()).unwrap();
    assert_eq!(
        a.to_vec::<i32>().unwrap(),
        vec![4, 3, 2, 1, 4, 3, 2, 1, 0, 0, 0, 0]
    );

    let c = copy(&block).unwrap();
    assert!(c.is_contiguous());
    assert_eq!(c.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4, 1, 2, 3, 4]);

    let f = cast(&c, DType::Float32).unwrap();
    assert_eq!(f.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0]);
}

#[cfg(feature = "parallel")]
#[test]
fn test_parallel_matches_sequential() {
    use strided_narray::ndloop_par;

    let mut rng = StdRng::seed_from_u64(5);
    let a = random_array(&mut rng, &[300, 200]);
    let b = random_array(&mut rng, &[200]);
    let seq = ndloop(&binary(LoopSupport::Strided), &[&a, &b], &LoopOptions::default(), mul)
        .unwrap();
    let par = ndloop_par(&binary(LoopSupport::Strided), &[&a, &b], &LoopOptions::default(), mul)
        .unwrap();
    assert_eq!(seq[0].to_vec::<f64>().unwrap(), par[0].to_vec::<f64>().unwrap());
}
