//! Bootstrap script evaluated once per Sandbox Session.
//!
//! Captures the ops in closures, builds the request-scoped `AP` namespace and
//! the `session`, `env`, `log` and `stop` globals, installs `request` and
//! `response`, then removes `Deno` and the code-generation primitives.
//! `__sy` holds the helpers the component executor calls between snippets.

pub(crate) const BOOTSTRAP: &str = r##"((ops) => {
    const setResult = (json) => ops.op_sy_set_result(json);
    const logLine = (msg) => ops.op_sy_log(String(msg));
    const makeRequestsOp = ops.op_sy_make_requests;

    const STOP = Object.freeze({ __stop: true });
    const NOT_CONFIGURED = Object.freeze({ __notConfigured: true });

    const lock = (name, value) => Object.defineProperty(globalThis, name, {
        value, writable: false, configurable: false, enumerable: false
    });

    const builder = (type, defaults, methods) => {
        const Ctor = function (fields) {
            if (!(this instanceof Ctor)) {
                return new Ctor(fields);
            }
            Object.assign(this, defaults(), fields || {});
            if (type !== null) {
                this.__type = type;
            }
        };
        Object.assign(Ctor.prototype, methods || {});
        Object.freeze(Ctor.prototype);
        return Object.freeze(Ctor);
    };

    const setJSONBody = function (obj) {
        this.body = JSON.stringify(obj);
        this.headers["Content-Type"] = "application/json";
    };
    const setJSONBodyPretty = function (obj) {
        this.body = JSON.stringify(obj, null, "    ");
        this.headers["Content-Type"] = "application/json";
    };
    const encodeForm = (obj) => Object.keys(obj || {})
        .map((k) => encodeURIComponent(k) + "=" + encodeURIComponent(String(obj[k])))
        .join("&");

    const HTTP = Object.freeze({
        Request: builder("http", () => ({
            method: "GET", url: null, query: {}, headers: {}, body: null
        }), {
            setJSONBody,
            setFormBody: function (obj) {
                this.method = "POST";
                this.body = encodeForm(obj);
                this.headers["Content-Type"] = "application/x-www-form-urlencoded";
            }
        }),
        Response: builder(null, () => ({
            statusCode: 200, headers: {}, body: null
        }), { setJSONBody, setJSONBodyPretty }),
        encodeForm
    });

    const sqlBuilder = (type) => builder(type, () => ({
        queryStatement: null, executeStatement: null,
        parameters: [], resultTypes: {}, transactions: false
    }), {
        query: function (stmt, params, resultTypes) {
            this.queryStatement = stmt;
            this.parameters = params || [];
            this.resultTypes = resultTypes || {};
        },
        execute: function (stmt, params) {
            this.executeStatement = stmt;
            this.parameters = params || [];
        }
    });
    const converter = (value, convertTo) => ({ _type: "Converter", value, convertTo });
    const SQL = Object.freeze({
        Request: sqlBuilder(null),
        Converter: converter,
        Int: (v) => converter(v, "int64"),
        Float: (v) => converter(v, "float64"),
        Bool: (v) => converter(v, "bool"),
        String: (v) => converter(v, "string")
    });
    const dialect = (type) => Object.freeze({ Request: sqlBuilder(type) });

    const Store = Object.freeze({
        Request: builder("store", () => ({ arguments: [] }), {
            query: function (...args) { this.arguments = args; },
            insert: function (collection, object) {
                this.arguments = ["insert", collection, object];
            },
            select: function (collection, query, ...params) {
                this.arguments = ["select", collection, query, ...params];
            },
            update: function (collection, id, object) {
                this.arguments = ["update", collection, id, object];
            },
            delete: function (collection, query, ...params) {
                this.arguments = ["delete", collection, query, ...params];
            }
        })
    });

    const ldapOp = function (operationName, args, options) {
        this.operationName = operationName;
        this.arguments = args;
        this.options = options || null;
    };
    const LDAP = Object.freeze({
        Scope: Object.freeze({ base: "base", single: "single", subtree: "subtree" }),
        Request: builder("ldap", () => ({ operationName: null, arguments: {}, options: null }), {
            search: function (baseDistinguishedName, scope, dereferenceAliases, sizeLimit,
                              timeLimit, typesOnly, filter, attributes, controls, options) {
                ldapOp.call(this, "search", {
                    baseDistinguishedName, scope, dereferenceAliases, sizeLimit,
                    timeLimit, typesOnly, filter, attributes, controls
                }, options);
            },
            bind: function (username, password) {
                ldapOp.call(this, "bind", { username, password });
            },
            add: function (distinguishedName, attributes) {
                ldapOp.call(this, "add", { distinguishedName, attributes });
            },
            modify: function (distinguishedName, addAttributes, deleteAttributes, replaceAttributes) {
                ldapOp.call(this, "modify", {
                    distinguishedName, addAttributes, deleteAttributes, replaceAttributes
                });
            },
            delete: function (distinguishedName) {
                ldapOp.call(this, "delete", { distinguishedName });
            },
            compare: function (distinguishedName, attribute, value) {
                ldapOp.call(this, "compare", { distinguishedName, attribute, value });
            }
        })
    });

    const SOAP = Object.freeze({
        Request: builder("soap", () => ({
            url: null, actionName: null, operationName: null, namespace: null,
            params: {}, headers: {}, body: null
        }))
    });

    const Redis = Object.freeze({
        Request: builder("redis", () => ({ executeStatement: null }), {
            execute: function (stmt) { this.executeStatement = stmt; }
        })
    });

    const SMTP = Object.freeze({
        Request: builder("smtp", () => ({
            to: [], from: null, subject: "", body: null, html: false
        }), {
            send: function (to, subject, body) {
                this.to = Array.isArray(to) ? to : [to];
                this.subject = subject;
                this.body = body;
            }
        })
    });

    const Docker = Object.freeze({
        Request: builder("docker", () => ({
            image: null, command: null, arguments: [], env: {}
        }), {
            execute: function (command, args, env) {
                this.command = command;
                this.arguments = args || [];
                this.env = env || {};
            }
        })
    });

    const Job = Object.freeze({
        Request: builder("job", () => ({
            operation: null, name: null, time: null, attributes: {}
        }), {
            run: function (name, attributes) {
                this.operation = "run";
                this.name = name;
                this.attributes = attributes || {};
            },
            schedule: function (time, name, attributes) {
                this.operation = "schedule";
                this.time = time;
                this.name = name;
                this.attributes = attributes || {};
            }
        })
    });

    const Key = Object.freeze({
        Request: builder("key", () => ({
            operation: null, name: null, secret: null, data: null, signature: null
        }), {
            create: function (name, secret) {
                this.operation = "create"; this.name = name; this.secret = secret || null;
            },
            delete: function (name) { this.operation = "delete"; this.name = name; },
            list: function () { this.operation = "list"; },
            sign: function (name, data) {
                this.operation = "sign"; this.name = name; this.data = data;
            },
            verify: function (name, data, signature) {
                this.operation = "verify"; this.name = name;
                this.data = data; this.signature = signature;
            }
        })
    });

    const Push = Object.freeze({
        Request: builder("push", () => ({
            operation: "push", channel: null, platform: null, token: null, payload: {}
        }), {
            push: function (channel, payload) {
                this.operation = "push"; this.channel = channel; this.payload = payload || {};
            },
            subscribe: function (platform, channel, token) {
                this.operation = "subscribe";
                this.platform = platform; this.channel = channel; this.token = token;
            },
            unsubscribe: function (platform, channel, token) {
                this.operation = "unsubscribe";
                this.platform = platform; this.channel = channel; this.token = token;
            }
        })
    });

    const Call = function (name) {
        if (!(this instanceof Call)) {
            return new Call(name);
        }
        this.name = name;
        this.request = null;
        this.response = null;
    };
    Object.freeze(Call.prototype);
    Object.freeze(Call);

    const makeRequests = async (descriptors) => {
        const calls = Array.from(descriptors || [], (d) => ({
            endpoint: d && d.remoteEndpoint ? String(d.remoteEndpoint) : null,
            request: d
        }));
        const resultJson = await makeRequestsOp(JSON.stringify(calls));
        return JSON.parse(resultJson);
    };
    const makeRequest = async (descriptor) => (await makeRequests([descriptor]))[0];

    lock("AP", Object.freeze({
        Call, HTTP, SQL, Store, LDAP, SOAP, Redis, SMTP, Docker, Job, Key, Push,
        Postgres: dialect("postgres"),
        MySQL: dialect("mysql"),
        SQLServer: dialect("sqlserver"),
        Oracle: dialect("oracle"),
        Hana: dialect("hana"),
        SQLite: dialect("sqlite"),
        makeRequest,
        makeRequests,
        log: logLine
    }));

    lock("session", Object.freeze({
        get: (key) => JSON.parse(ops.op_sy_session_get(String(key))),
        set: (key, value) => {
            const json = JSON.stringify(value === undefined ? null : value);
            ops.op_sy_session_set(String(key), json);
        },
        isSet: (key) => ops.op_sy_session_is_set(String(key)),
        delete: (key) => ops.op_sy_session_delete(String(key)),
        setOptions: (options) => ops.op_sy_session_set_options(JSON.stringify(options || {}))
    }));

    const envGet = (name) => {
        const r = JSON.parse(ops.op_sy_env_get(String(name)));
        return r.configured ? r.value : NOT_CONFIGURED;
    };
    lock("env", Object.freeze({
        name: ops.op_sy_env_name(),
        NOT_CONFIGURED,
        get: envGet,
        isConfigured: (name) => envGet(name) !== NOT_CONFIGURED
    }));

    lock("log", logLine);
    lock("stop", STOP);
    globalThis.console = Object.freeze({
        log: (...a) => logLine(a.map(String).join(" ")),
        info: (...a) => logLine(a.map(String).join(" ")),
        warn: (...a) => logLine(a.map(String).join(" ")),
        error: (...a) => logLine(a.map(String).join(" "))
    });

    globalThis.request = JSON.parse(ops.op_sy_request_json());
    globalThis.response = new HTTP.Response();

    lock("__sy", Object.freeze({
        STOP,
        setResult,
        prepareCalls: (names) => {
            for (const name of names) {
                if (!globalThis[name]) {
                    globalThis[name] = new Call(name);
                }
            }
        },
        dispatch: async (specs) => {
            const calls = specs.map((s) => globalThis[s.name]);
            const descriptors = calls.map((call, i) => {
                const req = call.request ? call.request : globalThis.request;
                return { endpoint: specs[i].endpoint, request: req };
            });
            const resultJson = await makeRequestsOp(JSON.stringify(descriptors));
            const responses = JSON.parse(resultJson);
            calls.forEach((call, i) => {
                call.response = responses[i];
            });
            if (calls.length === 1) {
                globalThis.response = calls[0].response;
            }
        },
        finalResponse: () => {
            const r = globalThis.response;
            return r === undefined ? null : r;
        }
    }));

    delete globalThis.Deno;

    // Remove code generation primitives to prevent prototype chain attacks.
    delete globalThis.eval;
    const AsyncFunction = (async function () {}).constructor;
    const GeneratorFunction = (function* () {}).constructor;
    Object.defineProperty(Function.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    Object.defineProperty(AsyncFunction.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
    Object.defineProperty(GeneratorFunction.prototype, 'constructor', {
        value: undefined, configurable: false, writable: false
    });
})(Deno.core.ops);"##;
