use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt};

const DEFAULT_LIMIT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, Flavor::Async).unwrap_or_else(|err| err.to_compile_error().into())
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, Flavor::Sync).unwrap_or_else(|err| err.to_compile_error().into())
}

#[derive(Clone, Copy)]
enum Flavor {
    Sync,
    Async,
}

fn expand(attr: TokenStream, item: TokenStream, flavor: Flavor) -> syn::Result<TokenStream> {
    let limit = parse_limit(attr)?;
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = syn::parse::<ItemFn>(item)?;

    let run = match flavor {
        Flavor::Async => {
            if sig.asyncness.take().is_none() {
                return Err(syn::Error::new_spanned(
                    &sig.ident,
                    "tokio_timeout_test expects an async fn",
                ));
            }
            quote! {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build Tokio runtime");
                runtime.block_on(async {
                    tokio::time::timeout(limit, async move #block)
                        .await
                        .expect("test timed out");
                });
            }
        }
        Flavor::Sync => {
            if sig.asyncness.is_some() {
                return Err(syn::Error::new_spanned(
                    &sig.ident,
                    "timeout expects a synchronous fn; use tokio_timeout_test",
                ));
            }
            quote! { #block; }
        }
    };

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();
    let name = sig.ident.to_string();
    let body = watchdog(limit, &name, run);

    Ok(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    }
    .into())
}

fn parse_limit(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_LIMIT_SECS);
    }
    let lit = syn::parse::<LitInt>(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// Runs `run` on a named worker thread and fails the test when it does not
/// report back within `limit_secs`. Panics inside the test are re-raised.
fn watchdog(limit_secs: u64, name: &str, run: TokenStream2) -> TokenStream2 {
    quote! {
        let limit = std::time::Duration::from_secs(#limit_secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::Builder::new()
            .name(format!("test-timeout:{}", #name))
            .spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #run
                }));
                let _ = sender.send(outcome);
            })
            .expect("failed to spawn test thread");
        match receiver.recv_timeout(limit) {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test {} timed out after {:?}", #name, limit)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test {} exited without reporting a result", #name)
            }
        }
    }
}

/// `#[test]` and `#[tokio::test]` are replaced by the generated `#[test]`.
fn is_test_marker(attr: &Attribute) -> bool {
    let idents: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        idents.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
