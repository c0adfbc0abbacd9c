use super::selector::{is_applicable, Algorithm, Selector};
use super::workspace::workspace_size as required_workspace;
use super::{direct, im2col, matmul, tiled, winograd};
use super::{get_sizes, Chain, Conv2DParams, ConvType, Direction};
use crate::back::{Backend, DevicePointer, MatmulProvider};
use crate::format::{DataFormat, FilterFormat};
use crate::helpers::{check_index_range, window_fits};
use crate::matmul::BatchFormat;
use crate::mem::Float;
use crate::runtime::Event;
use crate::status::{validate_param, Status, StatusCode};
use defer::defer;

/// Internal pointers to the three tensors of a launch.
#[derive(Debug, Clone)]
pub(super) struct Tensors<P> {
    pub input: P,
    pub filter: P,
    pub output: P,
}

#[derive(Debug, Clone)]
pub(super) struct Scratch<P> {
    pub ptr: P,
    pub size: usize,
}

fn validate_params<B: Backend>(direction: Direction, p: &Conv2DParams, backend: &B) -> Status {
    validate_param!(p.channels > 0, "The number of channels must be positive.");
    validate_param!(p.features > 0, "The number of features must be positive.");
    validate_param!(p.batch > 0, "The batch size must be positive.");
    validate_param!(p.in_rows > 0, "The number of input rows must be positive.");
    validate_param!(p.in_cols > 0, "The number of input columns must be positive.");
    validate_param!(p.out_rows > 0, "The number of output rows must be positive.");
    validate_param!(p.out_cols > 0, "The number of output columns must be positive.");
    validate_param!(p.window_rows > 0, "The number of window rows must be positive.");
    validate_param!(p.window_cols > 0, "The number of window columns must be positive.");
    validate_param!(p.stride_rows > 0, "The stride in the row direction must be positive.");
    validate_param!(p.stride_cols > 0, "The stride in the column direction must be positive.");
    validate_param!(
        window_fits(p.in_rows, p.out_rows, p.window_rows, p.stride_rows, p.pad_rows),
        "The output rows do not match the input rows, window, stride and padding."
    );
    validate_param!(
        window_fits(p.in_cols, p.out_cols, p.window_cols, p.stride_cols, p.pad_cols),
        "The output columns do not match the input columns, window, stride and padding."
    );
    validate_param!(p.dilation_rows == 1, "Dilation is not supported.");
    validate_param!(p.dilation_cols == 1, "Dilation is not supported.");
    validate_param!(p.groups > 0, "The number of groups must be positive.");
    validate_param!(
        p.channels % p.groups == 0,
        "The number of channels must be divisible by the number of groups."
    );
    validate_param!(
        p.features % p.groups == 0,
        "The number of features must be divisible by the number of groups."
    );
    match p.input_format {
        DataFormat::NHWC => validate_param!(
            matches!(p.filter_format, FilterFormat::HWCF | FilterFormat::FHWC),
            "NHWC data needs an HWCF or FHWC filter."
        ),
        DataFormat::NCHW => validate_param!(
            p.filter_format == FilterFormat::FCHW,
            "NCHW data needs an FCHW filter."
        ),
    }
    validate_param!(
        p.groups == 1 || direction == Direction::Forward,
        "Group convolution gradients are not supported."
    );
    if p.group_format == BatchFormat::Interleaved {
        validate_param!(p.groups > 1, "Interleaved groups need more than one group.");
        validate_param!(
            p.filter_format == FilterFormat::HWCF,
            "Interleaved groups need an HWCF filter."
        );
        validate_param!(
            backend.supports_interleaved_matmul(),
            "The backend cannot multiply interleaved batches."
        );
    }
    Status::default()
}

/// Runs a convolution with the algorithm `selector` picks.
///
/// `input`, `filter` and `output` hold the tensors described by
/// [`get_sizes`] for direction `C`. A workspace of `workspace_size` elements
/// is used for scratch memory; when `None` and one is needed, it is allocated
/// through the backend and released once the kernels are submitted.
#[allow(clippy::too_many_arguments)]
pub fn launch<T: Float, C: ConvType, B: MatmulProvider>(
    input: B::Pointer<T>,
    filter: B::Pointer<T>,
    output: B::Pointer<T>,
    params: &Conv2DParams,
    selector: &dyn Selector,
    backend: &B,
    workspace: Option<B::Pointer<T>>,
    workspace_size: usize,
    wait: &[Event],
) -> Status {
    let direction = C::DIRECTION;
    let status = validate_params(direction, params, backend);
    if !status.is_ok() {
        return status;
    }
    let sizes = get_sizes::<C>(params);
    if let Err(code) = check_index_range(&[sizes.input_size, sizes.filter_size, sizes.output_size]) {
        return code.into();
    }

    let algorithm = selector.select(direction, params);
    log::debug!("{} selected {algorithm} for {direction:?}", selector.name());
    let allowed = match (params.input_format, params.groups) {
        (DataFormat::NCHW, _) => algorithm == Algorithm::Direct,
        (_, 1) => true,
        _ => algorithm == Algorithm::Im2col,
    };
    if !allowed || !is_applicable(algorithm, direction, params) {
        log::warn!("{algorithm} cannot run {direction:?} {params:?}");
        return StatusCode::InvalidAlgorithm.into();
    }

    let needed = required_workspace(algorithm, direction, params);
    let workspace = workspace.filter(|p| !p.is_null());
    if workspace.is_some() && workspace_size < needed.required_size {
        log::warn!(
            "workspace of {workspace_size} elements, {algorithm} needs {}",
            needed.required_size
        );
        return StatusCode::InsufficientWorkspace.into();
    }

    // Scratch memory allocated here lives until the end of the launch;
    // kernels keep their own handles on it.
    let (workspace, workspace_size, owned) = match workspace {
        Some(ptr) => (Some(ptr), workspace_size, false),
        None if needed.recommended_size > 0 => match backend.allocate::<T>(needed.recommended_size) {
            Ok(ptr) => {
                log::debug!("allocated {} element workspace", needed.recommended_size);
                (Some(ptr), needed.recommended_size, true)
            }
            Err(e) => {
                log::warn!("workspace allocation failed: {e}");
                return StatusCode::AllocationProblem.into();
            }
        },
        None => (None, 0, false),
    };
    let _free = defer(|| {
        if let (true, Some(ptr)) = (owned, workspace.clone()) {
            backend.deallocate(ptr);
        }
    });

    let tensors = Tensors {
        input: backend.to_internal_pointer(input),
        filter: backend.to_internal_pointer(filter),
        output: backend.to_internal_pointer(output),
    };
    let scratch = workspace.clone().map(|ptr| Scratch {
        ptr: backend.to_internal_pointer(ptr),
        size: workspace_size,
    });
    let to_release = (tensors.clone(), scratch.clone());
    let _release = defer(move || {
        let (t, s) = to_release;
        backend.release_internal_pointer(t.input);
        backend.release_internal_pointer(t.filter);
        backend.release_internal_pointer(t.output);
        if let Some(s) = s {
            backend.release_internal_pointer(s.ptr);
        }
    });

    let mut chain = Chain::new::<B>(wait);
    match (algorithm, &scratch) {
        (Algorithm::Direct, _) => direct::launch(backend, direction, &tensors, params, &mut chain),
        (Algorithm::Tiled, _) => tiled::launch(backend, &tensors, params, &mut chain),
        (Algorithm::Matmul, _) => matmul::launch(backend, direction, &tensors, params, &mut chain),
        (Algorithm::Im2col, Some(ws)) => im2col::launch(backend, direction, &tensors, ws, params, &mut chain),
        (Algorithm::Winograd | Algorithm::WinogradLarge, Some(ws)) => winograd::launch(
            backend,
            direction,
            algorithm == Algorithm::WinogradLarge,
            &tensors,
            ws,
            params,
            &mut chain,
        ),
        (alg, _) => unreachable!("{alg} launched without a workspace"),
    }
    Status::ok(chain.last())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::back::{BufferBackend, MappedBackend, MemoryProvider, UsmBackend};
    use crate::conv2d::testing::{assert_close, download, init_logger, reference, run, tensors, upload};
    use crate::conv2d::{
        query_workspace_size, DefaultSelector, DirectSelector, FilterBackprop, Forward, Im2colSelector,
        InputBackprop, MatmulSelector, TiledSelector, WinogradLargeSelector, WinogradSelector,
    };
    use crate::helpers::{add_padding_to, PaddingMode};

    #[derive(Debug)]
    struct Always(Algorithm);

    impl Selector for Always {
        fn select(&self, _: Direction, _: &Conv2DParams) -> Algorithm {
            self.0
        }

        fn name(&self) -> &'static str {
            "always"
        }
    }

    fn params(window: usize, stride: usize, mode: PaddingMode) -> Conv2DParams {
        add_padding_to(
            Conv2DParams {
                channels: 3,
                features: 4,
                batch: 2,
                in_rows: 7,
                in_cols: 6,
                window_rows: window,
                window_cols: window,
                stride_rows: stride,
                stride_cols: stride,
                alpha: 1.5,
                beta: 0.5,
                ..Default::default()
            },
            mode,
        )
    }

    fn selectors() -> Vec<Box<dyn Selector>> {
        vec![
            Box::new(DirectSelector),
            Box::new(TiledSelector),
            Box::new(Im2colSelector),
            Box::new(WinogradSelector),
            Box::new(WinogradLargeSelector),
            Box::new(MatmulSelector),
            Box::new(DefaultSelector::new(true)),
        ]
    }

    /// Every selector that accepts `p` agrees with the host reference.
    fn check_all<C: ConvType, B: MatmulProvider>(b: &B, p: &Conv2DParams, seed: u64) -> usize {
        let [x, w, y] = tensors::<C>(p, seed);
        let want = reference(C::DIRECTION, p, &x, &w, &y);
        let mut ran = 0;
        for s in selectors() {
            let alg = s.select(C::DIRECTION, p);
            let got = run::<f32, C, B>(b, p, s.as_ref(), &x, &w, &y);
            if alg == Algorithm::NotSupported {
                assert_eq!(got, Err(StatusCode::InvalidAlgorithm));
                continue;
            }
            let what = format!("{alg} {:?} {:?}", C::DIRECTION, p.filter_format);
            assert_close(&got.unwrap(), &want, 1e-4, &what);
            ran += 1;
        }
        ran
    }

    #[test]
    fn test_ones_valid_3x3() {
        init_logger();
        let b = BufferBackend::host().unwrap();
        let p = add_padding_to(
            Conv2DParams {
                channels: 1,
                features: 1,
                in_rows: 4,
                in_cols: 4,
                window_rows: 3,
                window_cols: 3,
                ..Default::default()
            },
            PaddingMode::Valid,
        );
        assert_eq!((p.out_rows, p.out_cols), (2, 2));
        for s in [&DirectSelector as &dyn Selector, &Im2colSelector, &WinogradSelector, &TiledSelector] {
            let out = run::<f32, Forward, _>(&b, &p, s, &[1.0; 16], &[1.0; 9], &[0.0; 4]).unwrap();
            assert_eq!(out, vec![9.0; 4], "{}", s.name());
        }
    }

    #[test]
    fn test_algorithms_agree_with_reference() {
        init_logger();
        let b = BufferBackend::host().unwrap();
        let mut ran = 0;
        let configs = [
            params(1, 1, PaddingMode::Valid),
            params(1, 2, PaddingMode::Valid),
            params(3, 1, PaddingMode::Same),
            params(3, 1, PaddingMode::Valid),
            params(3, 2, PaddingMode::Same),
            params(5, 1, PaddingMode::Same),
            Conv2DParams {
                window_rows: 1,
                pad_rows: 0,
                out_rows: 7,
                ..params(3, 1, PaddingMode::Same)
            },
        ];
        for (i, base) in configs.into_iter().enumerate() {
            for filter_format in [FilterFormat::HWCF, FilterFormat::FHWC] {
                let p = Conv2DParams { filter_format, ..base };
                let seed = 10 * i as u64;
                ran += check_all::<Forward, _>(&b, &p, seed);
                ran += check_all::<InputBackprop, _>(&b, &p, seed + 3);
                ran += check_all::<FilterBackprop, _>(&b, &p, seed + 6);
            }
        }
        assert!(ran > 60, "only {ran} launches ran");
    }

    #[test]
    fn test_strided_5x5() {
        let b = BufferBackend::host().unwrap();
        let p = Conv2DParams {
            in_rows: 9,
            in_cols: 8,
            out_rows: 4,
            out_cols: 3,
            pad_rows: 1,
            pad_cols: 1,
            ..params(5, 2, PaddingMode::Valid)
        };
        check_all::<Forward, _>(&b, &p, 1);
        check_all::<InputBackprop, _>(&b, &p, 2);
        check_all::<FilterBackprop, _>(&b, &p, 3);
    }

    #[test]
    fn test_nchw_runs_direct() {
        let b = BufferBackend::host().unwrap();
        let p = Conv2DParams {
            input_format: DataFormat::NCHW,
            filter_format: FilterFormat::FCHW,
            ..params(3, 1, PaddingMode::Same)
        };
        assert_eq!(DefaultSelector::new(true).select(Direction::Forward, &p), Algorithm::Direct);
        assert_eq!(check_all::<Forward, _>(&b, &p, 4), 2);
        assert_eq!(check_all::<InputBackprop, _>(&b, &p, 5), 2);
        assert_eq!(check_all::<FilterBackprop, _>(&b, &p, 6), 2);
    }

    #[test]
    fn test_group_convolution() {
        let b = BufferBackend::host().unwrap();
        let base = Conv2DParams {
            channels: 4,
            features: 6,
            groups: 2,
            ..params(3, 1, PaddingMode::Same)
        };
        let layouts = [
            (FilterFormat::HWCF, BatchFormat::Strided),
            (FilterFormat::FHWC, BatchFormat::Strided),
            (FilterFormat::HWCF, BatchFormat::Interleaved),
        ];
        for (filter_format, group_format) in layouts {
            let p = Conv2DParams {
                filter_format,
                group_format,
                ..base
            };
            assert_eq!(check_all::<Forward, _>(&b, &p, 7), 2, "{filter_format:?} {group_format:?}");
        }
        let depthwise = Conv2DParams {
            channels: 3,
            features: 3,
            groups: 3,
            ..base
        };
        assert_eq!(check_all::<Forward, _>(&b, &depthwise, 8), 2);
    }

    #[test]
    fn test_groups_match_separate_convolutions() {
        let b = BufferBackend::host().unwrap();
        let p = Conv2DParams {
            channels: 2,
            features: 2,
            batch: 1,
            groups: 2,
            alpha: 1.0,
            beta: 0.0,
            ..params(3, 1, PaddingMode::Same)
        };
        let [x, w, y] = tensors::<Forward>(&p, 9);
        let grouped = run::<f64, Forward, _>(&b, &p, &Im2colSelector, &x, &w, &y).unwrap();

        let single = Conv2DParams { channels: 1, features: 1, groups: 1, ..p };
        let pixels = p.in_rows * p.in_cols;
        for g in 0..2 {
            let xg: Vec<f64> = (0..pixels).map(|i| x[i * 2 + g]).collect();
            let wg: Vec<f64> = (0..9).map(|i| w[i * 2 + g]).collect();
            let out = run::<f64, Forward, _>(&b, &single, &DirectSelector, &xg, &wg, &vec![0.0; pixels]).unwrap();
            let part: Vec<f64> = (0..pixels).map(|i| grouped[i * 2 + g]).collect();
            assert_close(&part, &out, 1e-12, "group");
        }
    }

    #[test]
    fn test_invalid_parameters_submit_nothing() {
        let b = BufferBackend::host().unwrap();
        let base = params(3, 1, PaddingMode::Same);
        let invalid = [
            Conv2DParams { channels: 0, ..base },
            Conv2DParams { stride_rows: 0, ..base },
            Conv2DParams { dilation_cols: 2, ..base },
            Conv2DParams { features: 5, groups: 2, channels: 4, ..base },
            Conv2DParams { filter_format: FilterFormat::FCHW, ..base },
            Conv2DParams { input_format: DataFormat::NCHW, ..base },
            Conv2DParams { group_format: BatchFormat::Interleaved, ..base },
            Conv2DParams { out_rows: 3, ..base },
            Conv2DParams { out_cols: 9, ..base },
            Conv2DParams { pad_rows: 3, ..base },
        ];
        let ptr = b.allocate::<f32>(1).unwrap();
        let before = b.get_queue().submission_count();
        for p in invalid {
            let status = launch::<f32, Forward, _>(
                ptr.clone(), ptr.clone(), ptr.clone(), &p, &DirectSelector, &b, None, 0, &[],
            );
            assert_eq!(status.status, StatusCode::InvalidParameter, "{p:?}");
            assert!(status.event.is_null());
        }
        let grouped = Conv2DParams { channels: 4, groups: 2, ..base };
        let status = launch::<f32, InputBackprop, _>(
            ptr.clone(), ptr.clone(), ptr, &grouped, &Im2colSelector, &b, None, 0, &[],
        );
        assert_eq!(status.status, StatusCode::InvalidParameter);
        assert_eq!(b.get_queue().submission_count(), before);
    }

    #[test]
    fn test_output_shape_must_match_input() {
        let b = BufferBackend::host().unwrap();
        let p = Conv2DParams {
            channels: 1,
            features: 1,
            in_rows: 4,
            in_cols: 4,
            out_rows: 2,
            out_cols: 2,
            window_rows: 1,
            window_cols: 1,
            ..Default::default()
        };
        let x = b.allocate::<f32>(16).unwrap();
        let w = b.allocate::<f32>(1).unwrap();
        let y = b.allocate::<f32>(4).unwrap();
        let before = b.get_queue().submission_count();
        for s in [&DefaultSelector::new(true) as &dyn Selector, &DirectSelector, &Always(Algorithm::Matmul)] {
            let status = launch::<f32, Forward, _>(x.clone(), w.clone(), y.clone(), &p, s, &b, None, 0, &[]);
            assert_eq!(status.status, StatusCode::InvalidParameter, "{}", s.name());
        }
        let past_end = Conv2DParams { out_rows: 10, ..p };
        let status = launch::<f32, Forward, _>(x, w, y, &past_end, &DirectSelector, &b, None, 0, &[]);
        assert_eq!(status.status, StatusCode::InvalidParameter);
        assert_eq!(b.get_queue().submission_count(), before);
    }

    #[cfg(not(feature = "index64"))]
    #[test]
    fn test_index_exceeded() {
        let b = BufferBackend::host().unwrap();
        let p = Conv2DParams {
            channels: 1,
            features: 1,
            batch: 1 << 16,
            in_rows: 256,
            in_cols: 256,
            out_rows: 256,
            out_cols: 256,
            window_rows: 1,
            window_cols: 1,
            ..Default::default()
        };
        let ptr = b.allocate::<f32>(1).unwrap();
        let before = b.get_queue().submission_count();
        let status = launch::<f32, Forward, _>(
            ptr.clone(), ptr.clone(), ptr, &p, &DirectSelector, &b, None, 0, &[],
        );
        assert_eq!(status.status, StatusCode::IndexExceeded);
        assert!(status.event.is_null());
        assert_eq!(b.get_queue().submission_count(), before);
    }

    #[test]
    fn test_invalid_algorithm() {
        let b = BufferBackend::host().unwrap();
        let p = params(5, 1, PaddingMode::Same);
        let [x, w, y] = tensors::<Forward>(&p, 11);
        assert_eq!(run::<f32, Forward, _>(&b, &p, &WinogradSelector, &x, &w, &y), Err(StatusCode::InvalidAlgorithm));
        assert_eq!(
            run::<f32, Forward, _>(&b, &p, &Always(Algorithm::Matmul), &x, &w, &y),
            Err(StatusCode::InvalidAlgorithm)
        );
        let grouped = Conv2DParams { channels: 4, features: 4, groups: 2, ..p };
        let [x, w, y] = tensors::<Forward>(&grouped, 12);
        for alg in [Algorithm::Direct, Algorithm::NotSupported] {
            assert_eq!(
                run::<f32, Forward, _>(&b, &grouped, &Always(alg), &x, &w, &y),
                Err(StatusCode::InvalidAlgorithm)
            );
        }
    }

    #[test]
    fn test_user_workspace() {
        let b = BufferBackend::host().unwrap();
        let p = Conv2DParams { batch: 3, ..params(3, 1, PaddingMode::Same) };
        let [x, w, y] = tensors::<Forward>(&p, 13);
        let want = reference(Direction::Forward, &p, &x, &w, &y);
        for selector in [&Im2colSelector as &dyn Selector, &WinogradSelector, &WinogradLargeSelector] {
            let size = query_workspace_size::<Forward>(&p, selector);
            assert!(size.required_size > 0 && size.recommended_size > size.required_size);
            let (xp, e1) = upload::<f32, _>(&b, &x);
            let (wp, e2) = upload::<f32, _>(&b, &w);
            let (yp, e3) = upload::<f32, _>(&b, &y);
            let ws = b.allocate::<f32>(size.required_size).unwrap();
            let wait = [e1, e2, e3];

            let status = launch::<f32, Forward, _>(
                xp.clone(), wp.clone(), yp.clone(), &p, selector, &b, Some(ws.clone()), size.required_size - 1, &wait,
            );
            assert_eq!(status.status, StatusCode::InsufficientWorkspace);

            // One image per pass.
            let status = launch::<f32, Forward, _>(
                xp, wp, yp.clone(), &p, selector, &b, Some(ws), size.required_size, &wait,
            );
            assert!(status.is_ok());
            let got = download::<f32, _>(&b, yp, want.len(), &[status.event]);
            assert_close(&got, &want, 1e-4, selector.name());
        }
    }

    #[test]
    fn test_minibatched_filter_gradient() {
        let b = UsmBackend::host().unwrap();
        let p = Conv2DParams { batch: 3, ..params(3, 1, PaddingMode::Same) };
        let [x, dy, dw] = tensors::<FilterBackprop>(&p, 14);
        let want = reference(Direction::FilterBackprop, &p, &x, &dy, &dw);
        for selector in [&Im2colSelector as &dyn Selector, &WinogradSelector] {
            let size = query_workspace_size::<FilterBackprop>(&p, selector);
            let (xp, e1) = upload::<f64, _>(&b, &x);
            let (dyp, e2) = upload::<f64, _>(&b, &dy);
            let (dwp, e3) = upload::<f64, _>(&b, &dw);
            let ws = b.allocate::<f64>(size.required_size + 1).unwrap();
            let status = launch::<f64, FilterBackprop, _>(
                xp, dyp, dwp, &p, selector, &b, Some(ws), size.required_size + 1, &[e1, e2, e3],
            );
            assert!(status.is_ok());
            let got = download::<f64, _>(&b, dwp, want.len(), &[status.event]);
            assert_close(&got, &want, 1e-9, selector.name());
        }
    }

    #[test]
    fn test_internal_pointers_released() {
        init_logger();
        let b = MappedBackend::host().unwrap();
        let p = params(3, 1, PaddingMode::Same);
        assert!(check_all::<Forward, _>(&b, &p, 15) >= 4);
        assert!(check_all::<InputBackprop, _>(&b, &p, 16) >= 3);
        assert_eq!(b.outstanding_internal_pointers(), 0);
    }

    #[test]
    fn test_usm_backend() {
        let b = UsmBackend::host().unwrap();
        let p = params(3, 1, PaddingMode::Same);
        let before = b.allocations();
        check_all::<Forward, _>(&b, &p, 17);
        check_all::<InputBackprop, _>(&b, &p, 18);
        check_all::<FilterBackprop, _>(&b, &p, 19);
        let grouped = Conv2DParams { channels: 4, features: 4, groups: 2, ..p };
        check_all::<Forward, _>(&b, &grouped, 20);
        b.get_queue().wait().unwrap();
        // Three tensors per launch, workspaces are freed by the launch.
        assert_eq!((b.allocations() - before) % 3, 0);
    }
}
