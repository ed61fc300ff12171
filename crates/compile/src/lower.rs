use swc_common::{
    DUMMY_SP, FileName, GLOBALS, Globals, Mark, SourceMap, Spanned, SyntaxContext, sync::Lrc,
};
use swc_ecma_ast::*;
use swc_ecma_codegen::{Emitter, text_writer::JsWriter};
use swc_ecma_parser::{Parser, StringInput, Syntax, TsSyntax, error::SyntaxError, lexer::Lexer};
use swc_ecma_transforms_base::resolver;
use swc_ecma_transforms_typescript::strip;
use swc_ecma_visit::{Fold, FoldWith, Visit, VisitWith};

use crate::CompileError;

/// Lower a TypeScript/JavaScript module to a plain script body.
///
/// Type annotations are stripped, `import` becomes `require(...)`, and
/// exports are written onto the `exports` / `module` bindings provided by the
/// executor's wrapper function.
pub fn lower_module(label: &str, source: &str) -> Result<String, CompileError> {
    let cm: Lrc<SourceMap> = Default::default();
    let fm = cm.new_source_file(
        FileName::Custom(label.to_string()).into(),
        source.to_string(),
    );

    let syntax = Syntax::Typescript(TsSyntax {
        tsx: false,
        decorators: false,
        dts: false,
        no_early_errors: false,
        disallow_ambiguous_jsx_like: true,
    });
    let lexer = Lexer::new(syntax, EsVersion::Es2022, StringInput::from(&*fm), None);
    let mut parser = Parser::new_from(lexer);
    let module = parser
        .parse_module()
        .map_err(|err| diagnostic(label, &cm, err))?;
    if let Some(err) = parser.take_errors().into_iter().next() {
        return Err(diagnostic(label, &cm, err));
    }

    if has_top_level_await(&module) {
        return Err(CompileError::new(format!(
            "{}: top-level await is not supported, await inside the handler instead",
            label
        )));
    }

    GLOBALS.set(&Globals::new(), || {
        let unresolved_mark = Mark::new();
        let top_level_mark = Mark::new();
        let mut program = Program::Module(module);
        let mut pass = resolver(unresolved_mark, top_level_mark, true);
        pass.process(&mut program);
        let mut pass = strip(unresolved_mark, top_level_mark);
        pass.process(&mut program);

        let module = match program {
            Program::Module(module) => module,
            Program::Script(_) => {
                return Err(CompileError::new(format!(
                    "{}: expected a module after type stripping",
                    label
                )));
            }
        };
        let module = module.fold_with(&mut CommonJsLowering::default());

        let mut buf = Vec::new();
        let mut cfg = swc_ecma_codegen::Config::default();
        cfg.minify = false;
        cfg.target = EsVersion::Es2022;
        {
            let mut emitter = Emitter {
                cfg,
                cm: cm.clone(),
                comments: None,
                wr: JsWriter::new(cm.clone(), "\n", &mut buf, None),
            };
            emitter
                .emit_module(&module)
                .map_err(|err| CompileError::new(format!("{}: {}", label, err)))?;
        }
        String::from_utf8(buf).map_err(|err| CompileError::new(format!("{}: {}", label, err)))
    })
}

fn diagnostic(label: &str, cm: &SourceMap, err: swc_ecma_parser::error::Error) -> CompileError {
    let loc = cm.lookup_char_pos(err.span().lo);
    let message = match err.kind() {
        SyntaxError::Eof => "unexpected end of file".to_string(),
        SyntaxError::UnterminatedStrLit => "unterminated string literal".to_string(),
        SyntaxError::UnterminatedTpl => "unterminated template literal".to_string(),
        SyntaxError::UnterminatedRegExp => "unterminated regular expression".to_string(),
        SyntaxError::LegacyOctal => "legacy octal literal not allowed".to_string(),
        SyntaxError::Unexpected { got, expected } => {
            format!("unexpected token {}, expected {}", got, expected)
        }
        other => other.msg().into_owned(),
    };
    CompileError::new(format!(
        "SyntaxError: {} ({}:{}:{})",
        message,
        label,
        loc.line,
        loc.col.0 + 1
    ))
}

fn has_top_level_await(module: &Module) -> bool {
    #[derive(Default)]
    struct Detector {
        depth: usize,
        found: bool,
    }

    impl Visit for Detector {
        fn visit_function(&mut self, n: &Function) {
            self.depth += 1;
            n.visit_children_with(self);
            self.depth -= 1;
        }

        fn visit_arrow_expr(&mut self, n: &ArrowExpr) {
            self.depth += 1;
            n.visit_children_with(self);
            self.depth -= 1;
        }

        fn visit_await_expr(&mut self, n: &AwaitExpr) {
            if self.depth == 0 {
                self.found = true;
            }
            n.visit_children_with(self);
        }

        fn visit_for_of_stmt(&mut self, n: &ForOfStmt) {
            if self.depth == 0 && n.is_await {
                self.found = true;
            }
            n.visit_children_with(self);
        }
    }

    let mut detector = Detector::default();
    detector.visit_module(module);
    detector.found
}

#[derive(Default)]
struct CommonJsLowering {
    temp_index: usize,
}

impl CommonJsLowering {
    fn temp(&mut self, prefix: &str) -> Ident {
        let ident = ident(&format!("{}_{}", prefix, self.temp_index));
        self.temp_index += 1;
        ident
    }

    fn lower_decl(&mut self, decl: ModuleDecl, out: &mut Vec<ModuleItem>) {
        match decl {
            ModuleDecl::Import(import) => lower_import(import, out),
            ModuleDecl::TsImportEquals(import) => {
                if import.is_type_only {
                    return;
                }
                if let TsModuleRef::TsExternalModuleRef(external) = import.module_ref {
                    let src = external.expr.value.to_string_lossy();
                    push(out, const_decl(Pat::Ident(import.id.into()), require_call(&src)));
                }
            }
            ModuleDecl::ExportDefaultExpr(expr) => push(out, export_assign("default", *expr.expr)),
            ModuleDecl::ExportDefaultDecl(decl) => match decl.decl {
                DefaultDecl::Fn(func) => match func.ident {
                    Some(name) => {
                        push(out, Stmt::Decl(Decl::Fn(FnDecl {
                            ident: name.clone(),
                            declare: false,
                            function: func.function,
                        })));
                        push(out, export_assign("default", Expr::Ident(name)));
                    }
                    None => {
                        let expr = Expr::Fn(FnExpr {
                            ident: None,
                            function: func.function,
                        });
                        push(out, export_assign("default", expr));
                    }
                },
                DefaultDecl::Class(class) => {
                    let expr = Expr::Class(ClassExpr { ident: class.ident, class: class.class });
                    push(out, export_assign("default", expr));
                }
                DefaultDecl::TsInterfaceDecl(_) => {}
            },
            ModuleDecl::ExportDecl(export) => {
                let mut names = Vec::new();
                decl_names(&export.decl, &mut names);
                push(out, Stmt::Decl(export.decl));
                for name in names {
                    let exported = name.sym.to_string();
                    push(out, export_assign(&exported, Expr::Ident(name)));
                }
            }
            ModuleDecl::ExportNamed(named) => {
                if named.type_only {
                    return;
                }
                self.lower_named_export(named, out);
            }
            ModuleDecl::ExportAll(all) => {
                if all.type_only {
                    return;
                }
                let module = self.temp("__fnMod");
                let key = self.temp("__fnKey");
                let src = all.src.value.to_string_lossy();
                push(out, const_decl(Pat::Ident(module.clone().into()), require_call(&src)));
                push(out, copy_all_exports(module, key));
            }
            ModuleDecl::TsExportAssignment(assign) => {
                let target = member(Expr::Ident(ident("module")), "exports");
                push(out, assign_stmt(target, *assign.expr));
            }
            ModuleDecl::TsNamespaceExport(_) => {}
        }
    }

    fn lower_named_export(&mut self, named: NamedExport, out: &mut Vec<ModuleItem>) {
        let source = match &named.src {
            Some(src) => {
                let module = self.temp("__fnMod");
                let src = src.value.to_string_lossy();
                push(out, const_decl(Pat::Ident(module.clone().into()), require_call(&src)));
                Some(module)
            }
            None => None,
        };

        for spec in named.specifiers {
            let (local, exported) = match spec {
                ExportSpecifier::Named(spec) => {
                    if spec.is_type_only {
                        continue;
                    }
                    let local = export_name(&spec.orig);
                    let exported = spec
                        .exported
                        .as_ref()
                        .map(export_name)
                        .unwrap_or_else(|| local.clone());
                    (Some(local), exported)
                }
                ExportSpecifier::Default(spec) => {
                    (Some("default".to_string()), spec.exported.sym.to_string())
                }
                ExportSpecifier::Namespace(spec) => (None, export_name(&spec.name)),
            };

            let value = match (&source, local) {
                (Some(module), Some(local)) => {
                    Expr::Member(member(Expr::Ident(module.clone()), &local))
                }
                (Some(module), None) => Expr::Ident(module.clone()),
                (None, Some(local)) => Expr::Ident(ident(&local)),
                (None, None) => continue,
            };
            push(out, export_assign(&exported, value));
        }
    }
}

impl Fold for CommonJsLowering {
    fn fold_module(&mut self, module: Module) -> Module {
        let mut body = Vec::with_capacity(module.body.len());
        for item in module.body {
            match item {
                ModuleItem::Stmt(stmt) => body.push(ModuleItem::Stmt(stmt)),
                ModuleItem::ModuleDecl(decl) => self.lower_decl(decl, &mut body),
            }
        }
        Module { body, ..module }
    }
}

fn lower_import(import: ImportDecl, out: &mut Vec<ModuleItem>) {
    if import.type_only {
        return;
    }
    let specifier = import.src.value.to_string_lossy().into_owned();
    let mut props = Vec::new();
    let mut bound = false;

    for spec in import.specifiers {
        match spec {
            ImportSpecifier::Namespace(ns) => {
                push(out, const_decl(Pat::Ident(ns.local.into()), require_call(&specifier)));
                bound = true;
            }
            ImportSpecifier::Default(default) => {
                props.insert(0, key_value("default", default.local))
            }
            ImportSpecifier::Named(named) => {
                if named.is_type_only {
                    continue;
                }
                let key = match named.imported {
                    Some(name) => export_name(&name),
                    None => named.local.sym.to_string(),
                };
                props.push(key_value(&key, named.local));
            }
        }
    }

    if !props.is_empty() {
        let pattern = Pat::Object(ObjectPat {
            span: DUMMY_SP,
            props,
            optional: false,
            type_ann: None,
        });
        push(out, const_decl(pattern, require_call(&specifier)));
    } else if !bound {
        push(out, Stmt::Expr(ExprStmt {
            span: DUMMY_SP,
            expr: Box::new(require_call(&specifier)),
        }));
    }
}

fn push(out: &mut Vec<ModuleItem>, stmt: Stmt) {
    out.push(ModuleItem::Stmt(stmt));
}

fn ident(name: &str) -> Ident {
    Ident::new(name.into(), DUMMY_SP, SyntaxContext::empty())
}

fn str_lit(value: &str) -> Str {
    Str {
        span: DUMMY_SP,
        value: value.into(),
        raw: None,
    }
}

fn export_name(name: &ModuleExportName) -> String {
    match name {
        ModuleExportName::Ident(ident) => ident.sym.to_string(),
        ModuleExportName::Str(s) => s.value.to_string_lossy().into_owned(),
    }
}

fn key_value(key: &str, local: Ident) -> ObjectPatProp {
    let key = if is_identifier(key) {
        PropName::Ident(IdentName::new(key.into(), DUMMY_SP))
    } else {
        PropName::Str(str_lit(key))
    };
    ObjectPatProp::KeyValue(KeyValuePatProp {
        key,
        value: Box::new(Pat::Ident(local.into())),
    })
}

fn require_call(specifier: &str) -> Expr {
    Expr::Call(CallExpr {
        span: DUMMY_SP,
        ctxt: SyntaxContext::empty(),
        callee: Callee::Expr(Box::new(Expr::Ident(ident("require")))),
        args: vec![ExprOrSpread {
            spread: None,
            expr: Box::new(Expr::Lit(Lit::Str(str_lit(specifier)))),
        }],
        type_args: None,
    })
}

fn const_decl(name: Pat, init: Expr) -> Stmt {
    Stmt::Decl(Decl::Var(Box::new(VarDecl {
        span: DUMMY_SP,
        kind: VarDeclKind::Const,
        declare: false,
        ctxt: SyntaxContext::empty(),
        decls: vec![VarDeclarator {
            span: DUMMY_SP,
            name,
            init: Some(Box::new(init)),
            definite: false,
        }],
    })))
}

fn member(obj: impl Into<Box<Expr>>, prop: &str) -> MemberExpr {
    let prop = if is_identifier(prop) {
        MemberProp::Ident(IdentName::new(prop.into(), DUMMY_SP))
    } else {
        MemberProp::Computed(ComputedPropName {
            span: DUMMY_SP,
            expr: Box::new(Expr::Lit(Lit::Str(str_lit(prop)))),
        })
    };
    MemberExpr {
        span: DUMMY_SP,
        obj: obj.into(),
        prop,
    }
}

fn assign_stmt(target: MemberExpr, value: Expr) -> Stmt {
    Stmt::Expr(ExprStmt {
        span: DUMMY_SP,
        expr: Box::new(Expr::Assign(AssignExpr {
            span: DUMMY_SP,
            op: AssignOp::Assign,
            left: AssignTarget::Simple(SimpleAssignTarget::Member(target)),
            right: Box::new(value),
        })),
    })
}

fn export_assign(exported: &str, value: Expr) -> Stmt {
    assign_stmt(member(Expr::Ident(ident("exports")), exported), value)
}

/// `for (const key in module) if (key !== "default") exports[key] = module[key];`
fn copy_all_exports(module: Ident, key: Ident) -> Stmt {
    let computed = |obj: Ident| MemberExpr {
        span: DUMMY_SP,
        obj: Box::new(Expr::Ident(obj)),
        prop: MemberProp::Computed(ComputedPropName {
            span: DUMMY_SP,
            expr: Box::new(Expr::Ident(key.clone())),
        }),
    };
    let body = Stmt::If(IfStmt {
        span: DUMMY_SP,
        test: Box::new(Expr::Bin(BinExpr {
            span: DUMMY_SP,
            op: BinaryOp::NotEqEq,
            left: Box::new(Expr::Ident(key.clone())),
            right: Box::new(Expr::Lit(Lit::Str(str_lit("default")))),
        })),
        cons: Box::new(assign_stmt(
            computed(ident("exports")),
            Expr::Member(computed(module.clone())),
        )),
        alt: None,
    });

    Stmt::ForIn(ForInStmt {
        span: DUMMY_SP,
        left: ForHead::VarDecl(Box::new(VarDecl {
            span: DUMMY_SP,
            kind: VarDeclKind::Const,
            declare: false,
            ctxt: SyntaxContext::empty(),
            decls: vec![VarDeclarator {
                span: DUMMY_SP,
                name: Pat::Ident(key.clone().into()),
                init: None,
                definite: false,
            }],
        })),
        right: Box::new(Expr::Ident(module)),
        body: Box::new(body),
    })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first == '$' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|ch| ch == '_' || ch == '$' || ch.is_ascii_alphanumeric())
}

fn decl_names(decl: &Decl, out: &mut Vec<Ident>) {
    match decl {
        Decl::Var(var) => var.decls.iter().for_each(|d| pat_names(&d.name, out)),
        Decl::Fn(func) => out.push(func.ident.clone()),
        Decl::Class(class) => out.push(class.ident.clone()),
        _ => {}
    }
}

fn pat_names(pat: &Pat, out: &mut Vec<Ident>) {
    match pat {
        Pat::Ident(binding) => out.push(binding.id.clone()),
        Pat::Array(array) => array.elems.iter().flatten().for_each(|p| pat_names(p, out)),
        Pat::Object(obj) => {
            for prop in &obj.props {
                match prop {
                    ObjectPatProp::Assign(assign) => out.push(assign.key.clone().into()),
                    ObjectPatProp::KeyValue(kv) => pat_names(&kv.value, out),
                    ObjectPatProp::Rest(rest) => pat_names(&rest.arg, out),
                }
            }
        }
        Pat::Assign(assign) => pat_names(&assign.left, out),
        Pat::Rest(rest) => pat_names(&rest.arg, out),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::lower_module;

    #[test]
    fn lowers_imports_to_require() {
        let source = r#"
import qs from "qs"
import { parse as parseQuery } from "qs"
import * as all from "qs"
import "qs"

export default async function handler(ctx) {
    return parseQuery(ctx.req.query)
}
"#;
        let code = lower_module("blog/hello.ts", source).expect("lower");
        assert!(code.contains("require(\"qs\")"));
        assert!(code.contains("default: qs"));
        assert!(code.contains("parse: parseQuery"));
        assert!(code.contains("const all = require(\"qs\")"));
        assert!(code.contains("exports.default = handler"));
        assert!(!code.contains("import "));
    }

    #[test]
    fn strips_type_annotations() {
        let source = r#"
interface Ctx { req: { query: Record<string, string> } }
type Reply = { ok: boolean }
export default async function handler(ctx: Ctx): Promise<Reply> {
    const value = ctx.req.query.value as string
    return { ok: value.length > 0 }
}
"#;
        let code = lower_module("blog/typed.ts", source).expect("lower");
        assert!(!code.contains("interface"));
        assert!(!code.contains("Promise<Reply>"));
        assert!(!code.contains(" as string"));
        assert!(code.contains("exports.default"));
    }

    #[test]
    fn lowers_named_and_reexports() {
        let source = r#"
export const limit = 10
export function helper() { return limit }
export { helper as alias }
export * from "qs"
export { stringify } from "qs"
"#;
        let code = lower_module("blog/named.ts", source).expect("lower");
        assert!(code.contains("exports.limit = limit"));
        assert!(code.contains("exports.helper = helper"));
        assert!(code.contains("exports.alias = helper"));
        assert!(code.contains("exports[__fnKey_1]"));
        assert!(code.contains("exports.stringify = __fnMod_2.stringify"));
    }

    #[test]
    fn export_assignment_targets_module_exports() {
        let code = lower_module("blog/assign.ts", "export = function (ctx: any) { return 1 }")
            .expect("lower");
        assert!(code.contains("module.exports = function"));
    }

    #[test]
    fn leaves_top_level_handler_alone() {
        let code = lower_module("blog/plain.js", "async function handler(ctx) { return 'hi' }")
            .expect("lower");
        assert!(code.contains("async function handler(ctx)"));
        assert!(!code.contains("exports"));
    }

    #[test]
    fn reports_location_of_syntax_errors() {
        let err = lower_module("blog/broken.ts", "export default function(").expect_err("fail");
        assert!(err.message.starts_with("SyntaxError:"));
        assert!(err.message.contains("blog/broken.ts:1:"));
    }

    #[test]
    fn rejects_top_level_await() {
        let source = "const x = await Promise.resolve(1)\nexport default () => x";
        let err = lower_module("blog/tla.ts", source).expect_err("fail");
        assert!(err.message.contains("top-level await"));
    }
}
