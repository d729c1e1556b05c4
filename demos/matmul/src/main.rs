//! Matrix-multiply demonstration workload
//!
//! Spawns one u-thread per (credit allotment, matrix size) class, each
//! squaring its own matrix, and prints per-class wall-time statistics
//! after the run drains. Under CREDIT the higher-allotment classes
//! should finish measurably earlier than the starved ones; under
//! PRIORITY all classes share one group and simply round-robin.

use std::env;
use std::process;
use std::time::Instant;

use fibril::{app_exit, app_init, uthread_create, SchedPolicy};

const THREADS_PER_CLASS: usize = 2;
const MATRIX_SIZES: [usize; 4] = [64, 128, 256, 512];
const CREDIT_VALUES: [i32; 4] = [25, 50, 75, 100];

struct MulArg {
    a: Vec<i64>,
    c: Vec<i64>,
    size: usize,
    credits: i32,
    created: Instant,
    elapsed_s: f64,
}

/// U-thread body: C = A x A for this u-thread's own matrix.
fn mulmat(raw: *mut u8) {
    let arg = unsafe { &mut *(raw as *mut MulArg) };
    let n = arg.size;

    for i in 0..n {
        for j in 0..n {
            let mut acc = 0i64;
            for k in 0..n {
                acc += arg.a[i * n + k] * arg.a[k * n + j];
            }
            arg.c[i * n + j] = acc;
        }
    }

    arg.elapsed_s = arg.created.elapsed().as_secs_f64();
}

fn main() {
    let policy = match env::args().nth(1).as_deref() {
        Some("0") => SchedPolicy::Priority,
        Some("1") => SchedPolicy::Credit,
        _ => {
            eprintln!("usage: matmul <0=priority | 1=credit>");
            process::exit(2);
        }
    };
    println!("scheduler: {:?}", policy);

    app_init(policy);

    let mut args: Vec<Box<MulArg>> = Vec::new();
    for &size in &MATRIX_SIZES {
        // Highest allotment first, matching creation order to class.
        for &credits in CREDIT_VALUES.iter().rev() {
            for _ in 0..THREADS_PER_CLASS {
                let mut arg = Box::new(MulArg {
                    a: vec![1; size * size],
                    c: vec![0; size * size],
                    size,
                    credits,
                    created: Instant::now(),
                    elapsed_s: 0.0,
                });
                let raw = &mut *arg as *mut MulArg as *mut u8;
                uthread_create(mulmat, raw, 0, credits);
                args.push(arg);
            }
        }
    }
    println!("spawned {} u-threads", args.len());

    app_exit();

    println!();
    println!("summary (wall time, creation to completion):");
    for &size in &MATRIX_SIZES {
        for &credits in &CREDIT_VALUES {
            let set: Vec<f64> = args
                .iter()
                .filter(|a| a.size == size && a.credits == credits)
                .map(|a| a.elapsed_s)
                .collect();
            let mean = set.iter().sum::<f64>() / set.len() as f64;
            let var = set.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / set.len() as f64;
            println!(
                "  credits {:3}, size {:3} -- mean {:9.6} s, stdev {:9.6} s",
                credits,
                size,
                mean,
                var.sqrt()
            );
        }
    }

    // Spot-check one result: squaring an all-ones matrix gives n in
    // every cell.
    let probe = &args[0];
    assert!(probe.c.iter().all(|&v| v == probe.size as i64));
}
