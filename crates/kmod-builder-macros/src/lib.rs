use proc_macro::TokenStream;

use quote::quote;
use syn::parse_quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, MetaNameValue, Token,
    parse::Parser, spanned::Spanned,
};

/// A statically known task, planned once per build definition.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Task(attr: TokenStream, item: TokenStream) -> TokenStream {
    match task_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

/// A task planned once per build target, with id `<prefix>:<target>`.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn TargetTask(attr: TokenStream, item: TokenStream) -> TokenStream {
    match target_task_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Module(attr: TokenStream, item: TokenStream) -> TokenStream {
    match module_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn lit_bool(expr: &Expr) -> syn::Result<bool> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Bool(b), ..
        }) => Ok(b.value),
        _ => Err(syn::Error::new(expr.span(), "expected bool literal")),
    }
}

fn expr_array_strings(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems.iter().map(lit_str).collect()
}

fn expr_path(expr: &Expr) -> syn::Result<syn::Path> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => Ok(path.clone()),
        _ => Err(syn::Error::new(expr.span(), "expected path (identifier)")),
    }
}

fn expr_array_paths(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems.iter().map(expr_path).collect()
}

fn expr_type(expr: &Expr) -> syn::Result<syn::Type> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => Ok(syn::Type::Path(syn::TypePath {
            qself: None,
            path: path.clone(),
        })),
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => syn::parse_str::<syn::Type>(&s.value()).map_err(|e| syn::Error::new(expr.span(), e)),
        _ => Err(syn::Error::new(
            expr.span(),
            "expected type (path) or string",
        )),
    }
}

fn drop_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            let Some(ident) = p.get_ident() else {
                return true;
            };
            ident != "Task" && ident != "TargetTask" && ident != "Module"
        })
        .cloned()
        .collect()
}

/// `key = value` pairs of an attribute, keyed by ident.
fn parse_kv(attr: TokenStream) -> syn::Result<Vec<(String, MetaNameValue)>> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let mut out = Vec::new();
    for m in parser.parse(attr)? {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        out.push((key, nv));
    }
    Ok(out)
}

fn required<T>(v: Option<T>, span: proc_macro2::Span, what: &str) -> syn::Result<T> {
    v.ok_or_else(|| syn::Error::new(span, what))
}

fn task_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();
    let span = struct_ident.span();

    let mut id: Option<String> = None;
    let mut module: Option<String> = None;
    let mut phase: Option<String> = None;
    let mut config_ty: Option<syn::Type> = None;
    let mut config_path: Option<String> = None;
    let mut provides: Vec<String> = Vec::new();
    let mut after: Vec<String> = Vec::new();
    let mut default_label: Option<String> = None;
    let mut core = false;

    for (key, nv) in parse_kv(attr)? {
        let v = &nv.value;
        match key.as_str() {
            "id" => id = Some(lit_str(v)?),
            "module" => module = Some(lit_str(v)?),
            "phase" => phase = Some(lit_str(v)?),
            "config" => config_ty = Some(expr_type(v)?),
            "config_path" => config_path = Some(lit_str(v)?),
            "provides" => provides = expr_array_strings(v)?,
            "after" => after = expr_array_strings(v)?,
            "default_label" => default_label = Some(lit_str(v)?),
            "core" => core = lit_bool(v)?,
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Task attribute key '{other}'"),
                ));
            }
        }
    }

    let id = required(id, span, "Task: missing id")?;
    let module = required(module, span, "Task: missing module")?;
    let phase = required(phase, span, "Task: missing phase")?;
    let default_label = required(default_label, span, "Task: missing default_label")?;
    let config_ty = config_ty.unwrap_or_else(|| parse_quote!(#struct_ident));

    let config_path = match config_path {
        Some(p) => p,
        None => {
            // <module>.steps.<step>, step being the last segment of the id.
            let prefix = format!("{module}.");
            let Some(step) = id.strip_prefix(&prefix).and_then(|rest| rest.rsplit('.').next())
            else {
                return Err(syn::Error::new(
                    span,
                    "Task: config_path omitted but id does not start with '<module>.'",
                ));
            };
            format!("{module}.steps.{step}")
        }
    };

    let enabled_check = if core {
        quote! {
            if !cfg.enabled {
                return Err(crate::Error::msg(format!(
                    "[{}].enabled=false is not allowed (core step)",
                    #config_path
                )));
            }
        }
    } else {
        quote! {
            if !cfg.enabled {
                return Ok(());
            }
        }
    };

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const ID: &'static str = #id;
            pub const MODULE: &'static str = #module;
            pub const PHASE: &'static str = #phase;
            pub const CONFIG_PATH: &'static str = #config_path;
            pub const CORE: bool = #core;

            pub fn plan(doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default();

                #enabled_check

                let label = cfg
                    .label
                    .clone()
                    .unwrap_or_else(|| #default_label.to_string());

                plan.add(crate::planner::Task {
                    id: #id.to_string(),
                    label,
                    module: #module.to_string(),
                    phase: #phase.to_string(),
                    after: vec![#(#after.to_string()),*],
                    provides: vec![#(#provides.to_string()),*],
                })
            }

            pub fn exec(doc: &crate::config::ConfigDoc, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default();

                #enabled_check

                if ctx.dry_run {
                    ctx.log(&format!("DRY-RUN: exec {}", #id));
                    return Ok(());
                }

                // Implemented by the task type:
                // `fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()>`
                Self::run(&cfg, doc, ctx)
            }
        }
    };

    Ok(expanded.into())
}

fn target_task_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();
    let span = struct_ident.span();

    let mut prefix: Option<String> = None;
    let mut module: Option<String> = None;
    let mut phase: Option<String> = None;
    let mut provides: Vec<String> = Vec::new();
    let mut after: Vec<String> = Vec::new();
    let mut default_label: Option<String> = None;

    for (key, nv) in parse_kv(attr)? {
        let v = &nv.value;
        match key.as_str() {
            "prefix" => prefix = Some(lit_str(v)?),
            "module" => module = Some(lit_str(v)?),
            "phase" => phase = Some(lit_str(v)?),
            "provides" => provides = expr_array_strings(v)?,
            "after" => after = expr_array_strings(v)?,
            "default_label" => default_label = Some(lit_str(v)?),
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown TargetTask attribute key '{other}'"),
                ));
            }
        }
    }

    let prefix = required(prefix, span, "TargetTask: missing prefix")?;
    let module = required(module, span, "TargetTask: missing module")?;
    let phase = required(phase, span, "TargetTask: missing phase")?;
    let default_label = required(default_label, span, "TargetTask: missing default_label")?;
    if prefix.contains(':') {
        return Err(syn::Error::new(span, "TargetTask: prefix must not contain ':'"));
    }

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const PREFIX: &'static str = #prefix;
            pub const MODULE: &'static str = #module;
            pub const PHASE: &'static str = #phase;

            pub fn task_id(target: &str) -> String {
                format!("{}:{}", #prefix, target)
            }

            /// Target name encoded in a task id produced by `task_id`.
            pub fn target_of(task_id: &str) -> Option<&str> {
                task_id
                    .strip_prefix(#prefix)
                    .and_then(|rest| rest.strip_prefix(':'))
                    .filter(|t| !t.is_empty())
            }

            pub fn plan_for(target: &str, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                // `{target}` in dependency and provide tokens names this target.
                let expand = |raw: &str| raw.replace("{target}", target);
                plan.add(crate::planner::Task {
                    id: Self::task_id(target),
                    label: format!("{} {}", #default_label, target),
                    module: #module.to_string(),
                    phase: #phase.to_string(),
                    after: vec![#(expand(#after)),*],
                    provides: vec![#(expand(#provides)),*],
                })
            }

            pub fn exec(doc: &crate::config::ConfigDoc, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()> {
                let task_id = ctx.current_task_id.clone().unwrap_or_default();
                let Some(target) = Self::target_of(&task_id).map(str::to_owned) else {
                    return Err(crate::Error::msg(format!(
                        "task '{}' does not name a target (expected '{}:<target>')",
                        task_id, #prefix
                    )));
                };

                if ctx.dry_run {
                    ctx.log(&format!("DRY-RUN: exec {}", task_id));
                    return Ok(());
                }

                // Implemented by the task type:
                // `fn run(target: &str, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()>`
                Self::run(&target, doc, ctx)
            }
        }
    };

    Ok(expanded.into())
}

fn module_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();
    let span = struct_ident.span();

    let mut id: Option<String> = None;
    let mut config_ty: Option<syn::Type> = None;
    let mut config_path: Option<String> = None;
    let mut tasks: Vec<syn::Path> = Vec::new();
    let mut target_tasks: Vec<syn::Path> = Vec::new();
    let mut targets: Option<syn::Path> = None;

    for (key, nv) in parse_kv(attr)? {
        let v = &nv.value;
        match key.as_str() {
            "id" => id = Some(lit_str(v)?),
            "config" => config_ty = Some(expr_type(v)?),
            "config_path" => config_path = Some(lit_str(v)?),
            "tasks" => tasks = expr_array_paths(v)?,
            "target_tasks" => target_tasks = expr_array_paths(v)?,
            "targets" => targets = Some(expr_path(v)?),
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Module attribute key '{other}'"),
                ));
            }
        }
    }

    let id = required(id, span, "Module: missing id")?;
    let config_ty = required(config_ty, span, "Module: missing config")?;
    let config_path = required(config_path, span, "Module: missing config_path")?;
    if tasks.is_empty() && target_tasks.is_empty() {
        return Err(syn::Error::new(span, "Module: declares no tasks"));
    }
    if !target_tasks.is_empty() && targets.is_none() {
        return Err(syn::Error::new(
            span,
            "Module: target_tasks requires targets = <fn(&Config) -> Result<Vec<String>>>",
        ));
    }

    let plan_tasks = tasks.iter().map(|p| quote! { #p::plan(doc, plan)?; });
    let plan_targets = targets.as_ref().map(|f| {
        quote! {
            for target in #f(&cfg)? {
                #( #target_tasks::plan_for(&target, plan)?; )*
            }
        }
    });
    let reg_tasks = tasks.iter().map(|p| quote! { reg.add(#p::ID, #p::exec)?; });
    let reg_target_tasks = target_tasks
        .iter()
        .map(|p| quote! { reg.add_prefixed(#p::PREFIX, #p::exec)?; });

    let expanded = quote! {
        #st

        impl crate::modules::Module for #struct_ident {
            fn id(&self) -> &'static str {
                #id
            }

            fn detect(&self, doc: &crate::config::ConfigDoc) -> bool {
                doc.has_table_path(self.id())
            }

            fn plan(&self, doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default();
                if !cfg.enabled {
                    return Ok(());
                }

                #(#plan_tasks)*
                #plan_targets
                Ok(())
            }
        }

        impl crate::executor::ModuleExec for #struct_ident {
            fn register_tasks(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                #(#reg_tasks)*
                #(#reg_target_tasks)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
