//! Minimal demo: an optimistic transfer plus a snapshot that keeps reading
//! the pre-transfer state.

use verso_mvcc::{LocalTransaction, MvccRuntime};

fn main() {
    tracing_subscriber::fmt::init();

    let runtime = MvccRuntime::with_defaults();
    let checking = runtime.versioned(100_i64);
    let savings = runtime.versioned(0_i64);

    let auditor = runtime.begin().expect("auditor snapshot");

    {
        let txn = LocalTransaction::begin(&runtime).expect("begin");
        checking.mutate(|v| *v -= 40).expect("debit");
        savings.mutate(|v| *v += 40).expect("credit");
        assert!(txn.commit().expect("commit"));
    }

    println!(
        "latest:  checking={} savings={}",
        checking.read().expect("read"),
        savings.read().expect("read")
    );
    {
        let _view = auditor.make_current();
        println!(
            "auditor: checking={} savings={}",
            checking.read().expect("read"),
            savings.read().expect("read")
        );
    }
}
