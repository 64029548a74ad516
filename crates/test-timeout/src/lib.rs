use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Runs an async test on a fresh current-thread Tokio runtime and fails it
/// if it has not finished within the given number of seconds.
///
/// ```ignore
/// #[test_timeout::tokio_timeout_test(5)]
/// async fn pairs_two_clients() { /* ... */ }
/// ```
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut function = parse_macro_input!(item as ItemFn);

    if function.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "tokio_timeout_test expects an async test function",
        )
        .to_compile_error()
        .into();
    }
    function.sig.asyncness = None;

    let block = &function.block;
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime for test");
        runtime.block_on(async {
            tokio::time::timeout(__test_timeout, async move #block)
                .await
                .expect("test timed out")
        })
    };

    expand(function, timeout_secs, body, is_tokio_test_attribute).into()
}

/// Runs a synchronous test on a watchdog thread and fails it if it has not
/// finished within the given number of seconds.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let function = parse_macro_input!(item as ItemFn);

    if function.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "timeout expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let block = &function.block;
    let body = quote! { #block };

    expand(function, timeout_secs, body, is_plain_test_attribute).into()
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be at least one second"));
    }
    Ok(secs)
}

/// Wraps `body` in a `#[test]` that runs it on a separate thread, re-raising
/// its panic or failing once `timeout_secs` elapses.
fn expand(
    function: ItemFn,
    timeout_secs: u64,
    body: TokenStream2,
    is_redundant: fn(&Attribute) -> bool,
) -> TokenStream2 {
    let ItemFn { attrs, vis, sig, .. } = function;
    let attrs: Vec<Attribute> = attrs.into_iter().filter(|attr| !is_redundant(attr)).collect();

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let __test_timeout = std::time::Duration::from_secs(#timeout_secs);
            let (__done_tx, __done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
                    #body
                }));
                let _ = __done_tx.send(outcome);
            });
            match __done_rx.recv_timeout(__test_timeout) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {}s", #timeout_secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
                }
            }
        }
    }
}

fn is_plain_test_attribute(attr: &Attribute) -> bool {
    attr.path().is_ident("test")
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments == ["tokio", "test"]
}
