use crate::error::{Stage, TJ, TJCode, TJException};
use crate::syntax::lex::Lexer;
use crate::syntax::token::*;
use crate::trace::def::{
    Arg, BoxPool, BoxRef, Const, Descr, GuardDescr, Kind, LoopToken, Operation, Trace,
};
use crate::trace::opcode::Opcode;
use crate::trace::snapshot::Snapshot;
use crate::{bail_at, ensure_at};
use rustc_hash::FxHashMap;
use std::sync::Arc;

const DEFAULT_LOOP_NAME: &str = "Loop0";

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    peek: Token,
    pool: BoxPool,
    names: FxHashMap<String, BoxRef>,
    tokens: FxHashMap<String, LoopToken>,
    loop_name: String,
    self_token: LoopToken,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str) -> Self {
        let mut lexer = Lexer::new(input);
        let current = lexer.next_token();
        let peek = lexer.next_token();
        let mut pool = BoxPool::new();
        let self_token = pool.fresh_token();
        Self {
            lexer,
            current,
            peek,
            pool,
            names: FxHashMap::default(),
            tokens: FxHashMap::default(),
            loop_name: DEFAULT_LOOP_NAME.to_string(),
            self_token,
        }
    }

    fn advance(&mut self) {
        self.current = std::mem::replace(&mut self.peek, self.lexer.next_token());
    }

    fn check_invalid(&self) -> TJ<()> {
        if let TokenKind::Invalid(msg) = &self.current.kind {
            bail_at!(
                self.current.span,
                "TJ.LexError",
                TJCode::E0001,
                Stage::Lex,
                "{}",
                msg
            );
        }
        Ok(())
    }

    fn expect(&mut self, kind: TokenKind) -> TJ<()> {
        self.check_invalid()?;
        if std::mem::discriminant(&self.current.kind) == std::mem::discriminant(&kind) {
            self.advance();
            Ok(())
        } else {
            bail_at!(
                self.current.span,
                "TJ.ParseError",
                TJCode::E0001,
                Stage::Parse,
                "Expected {:?}, got {:?}",
                kind,
                self.current.kind
            );
        }
    }

    fn expect_ident(&mut self) -> TJ<String> {
        self.check_invalid()?;
        match &self.current.kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => bail_at!(
                self.current.span,
                "TJ.ParseError",
                TJCode::E0001,
                Stage::Parse,
                "Expected a name, got {:?}",
                other
            ),
        }
    }

    pub fn parse_trace(&mut self) -> TJ<Trace> {
        if self.current.kind == TokenKind::Loop {
            self.advance();
            self.loop_name = self.expect_ident()?;
        }
        self.tokens
            .insert(self.loop_name.clone(), self.self_token);

        self.expect(TokenKind::LBracket)?;
        let mut inputargs = Vec::new();
        while self.current.kind != TokenKind::RBracket {
            let name = self.expect_ident()?;
            inputargs.push(self.define_box(&name)?);
            if self.current.kind == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBracket)?;

        // One bad operation does not hide the next: skip to the following
        // line and keep going, then report everything at once.
        let mut operations = Vec::new();
        let mut errors = Vec::new();
        while self.current.kind != TokenKind::EOF {
            let line = self.current.span.start_line;
            match self.check_invalid().and_then(|_| self.parse_op()) {
                Ok(op) => operations.push(op),
                Err(e) => {
                    errors.push(e);
                    self.skip_line(line);
                }
            }
        }
        if errors.len() > 1 {
            return Err(TJException::aggregate(
                "TJ.ParseError",
                TJCode::E0001,
                Stage::Parse,
                format!("{} operations failed to parse", errors.len()),
                errors,
            ));
        }
        if let Some(e) = errors.pop() {
            return Err(e);
        }

        Ok(Trace {
            name: self.loop_name.clone(),
            token: self.self_token,
            inputargs,
            operations,
            pool: std::mem::take(&mut self.pool),
        })
    }

    fn skip_line(&mut self, line: u32) {
        while self.current.kind != TokenKind::EOF && self.current.span.start_line <= line {
            self.advance();
        }
    }

    fn define_box(&mut self, name: &str) -> TJ<BoxRef> {
        let span = self.current.span;
        let Some(kind) = name.chars().next().and_then(Kind::from_prefix) else {
            bail_at!(
                span,
                "TJ.ParseError",
                TJCode::E1003,
                Stage::Parse,
                "box name '{}' must start with i, p or f",
                name
            );
        };
        if self.names.contains_key(name) {
            bail_at!(
                span,
                "TJ.ParseError",
                TJCode::E1002,
                Stage::Parse,
                "box '{}' is defined twice",
                name
            );
        }
        let b = self.pool.fresh_box(kind);
        self.names.insert(name.to_string(), b);
        Ok(b)
    }

    fn parse_arg(&mut self) -> TJ<Arg> {
        self.check_invalid()?;
        let span = self.current.span;
        match self.current.kind.clone() {
            TokenKind::Int(v) => {
                self.advance();
                Ok(Arg::Const(Const::Int(v)))
            }
            TokenKind::Float(v) => {
                self.advance();
                Ok(Arg::Const(Const::float(v)))
            }
            TokenKind::Ident(name) if name == "ConstPtr" => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let addr = match self.current.kind {
                    TokenKind::Int(v) if v >= 0 => v as u64,
                    _ => bail_at!(
                        self.current.span,
                        "TJ.ParseError",
                        TJCode::E0001,
                        Stage::Parse,
                        "ConstPtr takes a non-negative address, got {:?}",
                        self.current.kind
                    ),
                };
                self.advance();
                self.expect(TokenKind::RParen)?;
                Ok(Arg::Const(Const::Ref(addr)))
            }
            TokenKind::Ident(name) => match self.names.get(&name) {
                Some(b) => {
                    let b = *b;
                    self.advance();
                    Ok(Arg::Box(b))
                }
                None => bail_at!(
                    span,
                    "TJ.ParseError",
                    TJCode::E1001,
                    Stage::Parse,
                    "undefined box '{}'",
                    name
                ),
            },
            other => bail_at!(
                span,
                "TJ.ParseError",
                TJCode::E0001,
                Stage::Parse,
                "Expected an argument, got {:?}",
                other
            ),
        }
    }

    fn parse_arg_list(&mut self) -> TJ<Vec<Arg>> {
        self.expect(TokenKind::LBracket)?;
        let mut args = Vec::new();
        while self.current.kind != TokenKind::RBracket {
            args.push(self.parse_arg()?);
            if self.current.kind == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBracket)?;
        Ok(args)
    }

    fn parse_descr_name(&mut self) -> TJ<String> {
        if self.current.kind == TokenKind::Lt {
            self.advance();
            let name = self.expect_ident()?;
            self.expect(TokenKind::Gt)?;
            return Ok(name);
        }
        self.expect_ident()
    }

    fn parse_op(&mut self) -> TJ<Operation> {
        let op_span = self.current.span;
        let mut result_name = None;
        if matches!(self.current.kind, TokenKind::Ident(_)) && self.peek.kind == TokenKind::Assign {
            result_name = Some(self.expect_ident()?);
            self.advance();
        }

        let opname_span = self.current.span;
        let opname = self.expect_ident()?;
        let Some(opnum) = Opcode::from_name(&opname) else {
            bail_at!(
                opname_span,
                "TJ.ParseError",
                TJCode::E0002,
                Stage::Parse,
                "unknown operation '{}'",
                opname
            );
        };

        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        let mut descr_name = None;
        while self.current.kind != TokenKind::RParen {
            if self.current.kind == TokenKind::Ident("descr".to_string())
                && self.peek.kind == TokenKind::Assign
            {
                self.advance();
                self.advance();
                descr_name = Some(self.parse_descr_name()?);
            } else {
                args.push(self.parse_arg()?);
            }
            if self.current.kind == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;

        if let Some(expected) = opnum.arity() {
            ensure_at!(
                args.len() == expected,
                op_span,
                "TJ.ParseError",
                TJCode::E0001,
                Stage::Parse,
                "{} takes {} argument(s), got {}",
                opname,
                expected,
                args.len()
            );
        }

        let mut fail_args = None;
        let mut snapshot = None;
        if opnum.is_guard() {
            let fa = if self.current.kind == TokenKind::LBracket {
                self.parse_arg_list()?
            } else {
                Vec::new()
            };
            if self.current.kind == TokenKind::At {
                self.advance();
                let mut frames = Vec::new();
                while self.current.kind == TokenKind::LBracket {
                    frames.push(self.parse_arg_list()?);
                }
                // Frames are listed innermost first; build from the outermost.
                let mut chain: Option<Arc<Snapshot>> = None;
                for frame in frames.into_iter().rev() {
                    chain = Some(Snapshot::new(chain, frame));
                }
                snapshot = chain;
            } else {
                snapshot = Some(Snapshot::new(None, fa.clone()));
            }
            fail_args = Some(fa);
        }

        let descr = if opnum.is_guard() {
            Some(Descr::Guard(GuardDescr {
                number: self.pool.fresh_guard_number(),
                snapshot,
            }))
        } else if opnum == Opcode::Jump {
            let token = match descr_name {
                None => self.self_token,
                Some(name) => match self.tokens.get(&name) {
                    Some(t) => *t,
                    None => {
                        let t = self.pool.fresh_token();
                        self.tokens.insert(name, t);
                        t
                    }
                },
            };
            Some(Descr::Loop(token))
        } else if matches!(
            opnum,
            Opcode::SetfieldGc | Opcode::GetfieldGc | Opcode::GetfieldGcPure
        ) {
            match descr_name {
                Some(name) => Some(Descr::Field(name)),
                None => bail_at!(
                    op_span,
                    "TJ.ParseError",
                    TJCode::E0001,
                    Stage::Parse,
                    "{} needs a field descr",
                    opname
                ),
            }
        } else if opnum == Opcode::New {
            Some(Descr::Size(descr_name.unwrap_or_else(|| "object".to_string())))
        } else {
            descr_name.map(Descr::Size)
        };

        let result = match result_name {
            Some(name) => {
                if !opnum.has_result() {
                    bail_at!(
                        op_span,
                        "TJ.ParseError",
                        TJCode::E0001,
                        Stage::Parse,
                        "{} does not produce a value",
                        opname
                    );
                }
                let b = self.define_box(&name)?;
                if let Some(kind) = opnum.result_kind()
                    && kind != b.kind
                {
                    bail_at!(
                        op_span,
                        "TJ.ParseError",
                        TJCode::E1003,
                        Stage::Parse,
                        "{} produces {:?} but '{}' is {:?}",
                        opname,
                        kind,
                        name,
                        b.kind
                    );
                }
                Some(b)
            }
            None if opnum.has_result() && !matches!(opnum, Opcode::Call | Opcode::CallPure) => {
                bail_at!(
                    op_span,
                    "TJ.ParseError",
                    TJCode::E0001,
                    Stage::Parse,
                    "{} needs a result box",
                    opname
                );
            }
            None => None,
        };

        Ok(Operation {
            opnum,
            args,
            result,
            descr,
            fail_args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> TJ<Trace> {
        Parser::new(src).parse_trace()
    }

    #[test]
    fn parses_header_ops_and_jump() {
        let t = parse(
            "loop L\n[i0, p1]\ni2 = int_add(i0, 1)\np3 = getfield_gc(p1, descr=next)\njump(i2, p3, descr=L)\n",
        )
        .unwrap();
        assert_eq!(t.name, "L");
        assert_eq!(t.inputargs.len(), 2);
        assert_eq!(t.operations.len(), 3);
        assert_eq!(t.operations[1].descr, Some(Descr::Field("next".into())));
        assert_eq!(t.operations[2].loop_token(), Some(t.token));
    }

    #[test]
    fn guard_snapshot_defaults_to_fail_args() {
        let t = parse("[i0]\nguard_true(i0) [i0, 5]\njump(i0)").unwrap();
        let g = t.operations[0].guard_descr().unwrap();
        let snap = g.snapshot.as_ref().unwrap();
        assert_eq!(snap.depth(), 1);
        assert_eq!(snap.boxes, t.operations[0].fail_args.clone().unwrap());
    }

    #[test]
    fn explicit_snapshot_frames_innermost_first() {
        let t = parse(
            "[i0, i1]\nguard_false(i0, descr=<Guard7>) [i0] @ [i0] [i1, ConstPtr(16)]\njump(i0, i1)",
        )
        .unwrap();
        let snap = t.operations[0]
            .guard_descr()
            .unwrap()
            .snapshot
            .clone()
            .unwrap();
        assert_eq!(snap.depth(), 2);
        assert_eq!(snap.boxes, vec![Arg::Box(t.inputargs[0])]);
        let outer = snap.prev.as_ref().unwrap();
        assert_eq!(outer.boxes, vec![Arg::Box(t.inputargs[1]), Arg::Const(Const::Ref(16))]);
    }

    #[test]
    fn foreign_jump_gets_its_own_token() {
        let t = parse("[i0]\njump(i0, descr=Other)").unwrap();
        let target = t.operations[0].loop_token().unwrap();
        assert_ne!(target, t.token);
    }

    #[test]
    fn reports_errors_with_codes() {
        let code = |src: &str| parse(src).err().map(|e| e.code);
        assert_eq!(code("[i0]\ni1 = int_frob(i0)"), Some(TJCode::E0002));
        assert_eq!(code("[i0]\ni1 = int_add(i0, i9)"), Some(TJCode::E1001));
        assert_eq!(code("[i0]\ni0 = int_add(i0, 1)"), Some(TJCode::E1002));
        assert_eq!(code("[i0]\np1 = int_add(i0, 1)"), Some(TJCode::E1003));
        assert_eq!(code("[i0]\ni1 = int_add(i0)"), Some(TJCode::E0001));
        assert_eq!(code("[i0]\njump(i0) $"), Some(TJCode::E0001));
    }

    #[test]
    fn reports_every_bad_line() {
        let err = parse("[i0]\ni1 = int_frob(i0)\ni2 = int_add(i0, 1)\ni3 = int_add(i0)\njump(i2)")
            .unwrap_err();
        assert_eq!(err.related.len(), 2);
        assert_eq!(err.related[0].code, TJCode::E0002);
        assert_eq!(err.related[1].code, TJCode::E0001);
        assert_eq!(err.related[1].span.map(|s| s.start_line), Some(4));
    }

    #[test]
    fn error_points_at_the_offending_line() {
        let err = parse("[i0]\ni1 = int_add(i0, 1)\ni2 = bogus(i1)").unwrap_err();
        assert_eq!(err.span.map(|s| s.start_line), Some(3));
    }
}
