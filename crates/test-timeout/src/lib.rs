//! `#[timeout]` and `#[tokio_timeout_test]`: test attributes that fail a
//! test which runs longer than its budget (default 60 seconds) instead of
//! hanging the whole suite.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, Block, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Synchronous test with a wall-clock budget.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous test; use tokio_timeout_test for async ones",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip(attrs, is_test_attribute);
    let body = quote! { (|| #block)() };
    let harness = harness(timeout_secs, body);
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig #harness
    })
}

/// Async test on a current-thread runtime with time enabled, bounded both
/// in runtime time and wall-clock time. Paused time works inside.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip(attrs, is_tokio_test_attribute);
    let body = runtime_body(timeout_secs, &block);
    let harness = harness(timeout_secs, body);
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig #harness
    })
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

fn runtime_body(timeout_secs: u64, block: &Block) -> TokenStream2 {
    quote! {{
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(
                std::time::Duration::from_secs(#timeout_secs),
                async move #block,
            )
            .await
            .expect("test timed out");
        })
    }}
}

/// Runs `body` on its own thread so a hung test is reported as a failure
/// while the rest of the suite carries on. Panics are re-raised on the
/// test thread.
fn harness(timeout_secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {{
        let budget = std::time::Duration::from_secs(#timeout_secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                #body;
            }));
            let _ = sender.send(outcome);
        });
        match receiver.recv_timeout(budget) {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded its {}s budget", #timeout_secs)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting a result")
            }
        }
    }}
}

fn strip(attrs: Vec<Attribute>, unwanted: fn(&Attribute) -> bool) -> Vec<Attribute> {
    attrs.into_iter().filter(|attr| !unwanted(attr)).collect()
}

fn is_test_attribute(attr: &Attribute) -> bool {
    attr.path().is_ident("test")
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
